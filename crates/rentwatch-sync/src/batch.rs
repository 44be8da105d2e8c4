//! Batch ingestion: one sequential worker per source website, all sharing the
//! same store, with a JSON summary written per run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rentwatch_core::{ParsedListing, UpsertOutcome};
use serde::Serialize;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::UpsertEngine;

/// A newly created listing worth telling someone about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewListingAlert {
    pub listing_id: Uuid,
    pub source_website_code: String,
    pub source_listing_id: String,
    pub url: String,
    pub title: String,
    pub score: i32,
    pub price_monthly_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    pub source_website_code: String,
    pub source_listing_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceIngestReport {
    pub source_website_code: String,
    pub processed: usize,
    pub created: usize,
    pub merged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: usize,
    pub created: usize,
    pub merged: usize,
    pub failed: usize,
    pub sources: Vec<SourceIngestReport>,
    pub alerts: Vec<NewListingAlert>,
    pub failures: Vec<IngestFailure>,
    pub report_path: String,
}

struct WorkerResult {
    report: SourceIngestReport,
    alerts: Vec<NewListingAlert>,
    failures: Vec<IngestFailure>,
}

pub struct IngestRunner {
    engine: UpsertEngine,
    notify_min_score: i32,
    reports_dir: PathBuf,
}

impl IngestRunner {
    pub fn new(engine: UpsertEngine, notify_min_score: i32, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            notify_min_score,
            reports_dir: reports_dir.into(),
        }
    }

    pub async fn run(&self, records: Vec<ParsedListing>) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let total_records = records.len();

        let mut groups: BTreeMap<String, Vec<ParsedListing>> = BTreeMap::new();
        for record in records {
            groups
                .entry(record.source_website_code.clone())
                .or_default()
                .push(record);
        }
        info!(%run_id, total_records, sources = groups.len(), "ingest run started");

        let mut workers = JoinSet::new();
        for (code, group) in groups {
            let engine = self.engine.clone();
            let min_score = self.notify_min_score;
            workers.spawn(async move { ingest_group(engine, code, group, min_score).await });
        }

        let mut sources = Vec::new();
        let mut alerts = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let result = joined.context("ingest worker panicked")?;
            sources.push(result.report);
            alerts.extend(result.alerts);
            failures.extend(result.failures);
        }
        sources.sort_by(|a, b| a.source_website_code.cmp(&b.source_website_code));

        let finished_at = Utc::now();
        let run_dir = self.reports_dir.join(run_id.to_string());
        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at,
            total_records,
            created: sources.iter().map(|s| s.created).sum(),
            merged: sources.iter().map(|s| s.merged).sum(),
            failed: sources.iter().map(|s| s.failed).sum(),
            sources,
            alerts,
            failures,
            report_path: run_dir.join("ingest_summary.json").display().to_string(),
        };
        write_summary(&run_dir, &summary).await?;

        info!(
            %run_id,
            created = summary.created,
            merged = summary.merged,
            failed = summary.failed,
            alerts = summary.alerts.len(),
            "ingest run finished"
        );
        Ok(summary)
    }
}

async fn ingest_group(
    engine: UpsertEngine,
    code: String,
    group: Vec<ParsedListing>,
    notify_min_score: i32,
) -> WorkerResult {
    let mut report = SourceIngestReport {
        source_website_code: code.clone(),
        ..SourceIngestReport::default()
    };
    let mut alerts = Vec::new();
    let mut failures = Vec::new();

    for record in &group {
        report.processed += 1;
        match engine.upsert(record).await {
            Ok(outcome) => {
                if outcome.created_new_listing {
                    report.created += 1;
                } else {
                    report.merged += 1;
                }
                if let Some(alert) = alert_for(record, &outcome, notify_min_score) {
                    alerts.push(alert);
                }
            }
            Err(err) => {
                report.failed += 1;
                warn!(
                    source = %code,
                    source_listing_id = %record.source_listing_id,
                    error = %err,
                    "record failed to upsert"
                );
                failures.push(IngestFailure {
                    source_website_code: code.clone(),
                    source_listing_id: record.source_listing_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    WorkerResult {
        report,
        alerts,
        failures,
    }
}

/// Only freshly created, priced listings above the score floor raise an alert.
pub fn alert_for(
    record: &ParsedListing,
    outcome: &UpsertOutcome,
    notify_min_score: i32,
) -> Option<NewListingAlert> {
    let score = outcome.score?;
    if !outcome.created_new_listing || score <= notify_min_score || outcome.price_monthly_cents <= 0 {
        return None;
    }
    Some(NewListingAlert {
        listing_id: outcome.listing_id,
        source_website_code: record.source_website_code.clone(),
        source_listing_id: record.source_listing_id.clone(),
        url: record.url.clone(),
        title: record.title.clone(),
        score,
        price_monthly_cents: outcome.price_monthly_cents,
    })
}

/// Parse a JSON array of records, or one record per line (JSON Lines).
pub fn parse_records(text: &str) -> Result<Vec<ParsedListing>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).context("parsing listing array");
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("parsing listing on line {}", idx + 1))
        })
        .collect()
}

pub async fn load_records(path: &Path) -> Result<Vec<ParsedListing>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_records(&text).with_context(|| format!("loading records from {}", path.display()))
}

async fn write_summary(run_dir: &Path, summary: &IngestSummary) -> Result<()> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let bytes = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
    fs::write(run_dir.join("ingest_summary.json"), bytes)
        .await
        .context("writing ingest_summary.json")?;
    Ok(())
}
