use std::sync::Arc;

use rentwatch_core::ParsedListing;
use rentwatch_storage::{ListingStore, MemoryStore};
use rentwatch_sync::{
    load_records, seed_source_websites, IngestRunner, IngestSummary, SourceRegistry, UpsertEngine,
};

fn record(code: &str, id: &str, building: &str, reference: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "sourceWebsiteCode": code,
        "sourceListingId": id,
        "url": format!("https://{}.example/{id}", code.to_lowercase()),
        "referenceRaw": reference,
        "title": format!("3 pièces {building}"),
        "city": "Monaco",
        "district": "Monte-Carlo",
        "buildingName": building,
        "contractType": "RENT",
        "propertyType": "APARTMENT",
        "priceMonthlyCents": 850_000,
        "rooms": 3,
        "totalAreaSqm": 100.0,
        "hasElevator": true
    })
}

async fn runner(store: Arc<MemoryStore>, reports: &std::path::Path) -> IngestRunner {
    let text = std::fs::read_to_string(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml"),
    )
    .unwrap();
    let registry = SourceRegistry::from_yaml_str(&text).unwrap();
    seed_source_websites(&*store, &registry).await.unwrap();
    IngestRunner::new(UpsertEngine::new(store), 0, reports)
}

#[tokio::test]
async fn batch_run_counts_merges_failures_and_alerts() {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(store.clone(), reports.path()).await;

    let input = serde_json::json!([
        record("CIM", "1001", "Le Millefiori", Some("RIF 778")),
        record("CIM", "1002", "Le Schuylkill", None),
        record("MCRE", "mc-778", "Le Millefiori", Some("778")),
        record("XYZ", "9", "Le Millefiori", None),
    ]);
    let file = reports.path().join("listings.json");
    std::fs::write(&file, serde_json::to_vec(&input).unwrap()).unwrap();
    let records: Vec<ParsedListing> = load_records(&file).await.unwrap();

    let summary = runner.run(records).await.unwrap();

    assert_eq!(summary.total_records, 4);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.alerts.len(), 2);
    assert_eq!(summary.failures[0].source_website_code, "XYZ");
    let codes: Vec<_> = summary
        .sources
        .iter()
        .map(|s| s.source_website_code.as_str())
        .collect();
    assert_eq!(codes, vec!["CIM", "MCRE", "XYZ"]);

    assert_eq!(store.listing_count().await, 2);
    assert_eq!(store.all_listing_sources().await.unwrap().len(), 3);

    let written = std::fs::read_to_string(&summary.report_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed["created"], 2);
    assert_eq!(parsed["run_id"], summary.run_id.to_string());
}

#[tokio::test]
async fn rerunning_the_same_batch_creates_nothing() {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(store.clone(), reports.path()).await;
    let records: Vec<ParsedListing> = serde_json::from_value(serde_json::json!([
        record("CIM", "1001", "Le Millefiori", None),
        record("MCRE", "mc-1", "Le Schuylkill", None),
    ]))
    .unwrap();

    let first: IngestSummary = runner.run(records.clone()).await.unwrap();
    let second: IngestSummary = runner.run(records).await.unwrap();

    assert_eq!(first.created, 2);
    assert_eq!(second.created, 0);
    assert_eq!(second.merged, 2);
    assert!(second.alerts.is_empty());
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.listing_count().await, 2);
}
