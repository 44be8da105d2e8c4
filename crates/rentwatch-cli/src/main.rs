use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rentwatch_storage::{ListingStore, MemoryStore, PgStore, PgStoreConfig};
use rentwatch_sync::maintenance::DuplicateSide;
use rentwatch_sync::{
    backfill_scores, load_records, scan_duplicates, seed_source_websites, today_summary,
    IngestRunner, SourceRegistry, SyncConfig, UpsertEngine,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rentwatch-cli")]
#[command(about = "Rental listing identity resolver")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Upsert the source websites from the registry file.
    Seed,
    /// Upsert parsed listings from a JSON array or JSON Lines file.
    Ingest {
        file: PathBuf,
        /// Run against an in-memory store seeded from the registry.
        #[arg(long)]
        dry_run: bool,
    },
    /// Recompute the score of every rental listing.
    BackfillScores,
    /// Count listings first seen today (Paris time), grouped by rooms.
    DailySummary,
    /// Report listing pairs that probably describe the same unit.
    FindDuplicates {
        /// Pairs printed per match reason.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Ingest {
        file: PathBuf::from("listings.json"),
        dry_run: false,
    });
    info!(?command, "rentwatch-cli starting");

    match command {
        Commands::Migrate => {
            pg_store(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed => {
            let store = pg_store(&config).await?;
            let registry = SourceRegistry::load(&config.sources_file).await?;
            let seeded = seed_source_websites(&*store, &registry).await?;
            for website in seeded {
                println!("seeded {} ({}) id={}", website.code, website.name, website.id);
            }
        }
        Commands::Ingest { file, dry_run } => {
            let store: Arc<dyn ListingStore> = if dry_run {
                let memory = Arc::new(MemoryStore::new());
                let registry = SourceRegistry::load(&config.sources_file).await?;
                seed_source_websites(&*memory, &registry).await?;
                memory
            } else {
                pg_store(&config).await?
            };
            let records = load_records(&file).await?;
            let runner = IngestRunner::new(
                UpsertEngine::new(store),
                config.notify_min_score,
                config.reports_dir.clone(),
            );
            let summary = runner.run(records).await?;
            println!(
                "ingest complete: run_id={} records={} created={} merged={} failed={} report={}",
                summary.run_id,
                summary.total_records,
                summary.created,
                summary.merged,
                summary.failed,
                summary.report_path
            );
            for alert in &summary.alerts {
                println!(
                    "new listing: score={} price={} EUR {} {}",
                    alert.score,
                    alert.price_monthly_cents / 100,
                    alert.title,
                    alert.url
                );
            }
        }
        Commands::BackfillScores => {
            let store = pg_store(&config).await?;
            let report = backfill_scores(&*store).await?;
            println!(
                "backfill complete: total={} updated={} errors={}",
                report.total, report.updated, report.errors
            );
            for (score, count) in report.distribution.iter().take(20) {
                println!("score {score}: {count} listings");
            }
        }
        Commands::DailySummary => {
            let store = pg_store(&config).await?;
            let summary = today_summary(&*store, Utc::now()).await?;
            println!("new listings on {}: {}", summary.date_label(), summary.total);
            for group in &summary.by_rooms {
                match group.rooms {
                    Some(rooms) => println!("  {rooms} rooms: {}", group.count),
                    None => println!("  rooms unknown: {}", group.count),
                }
            }
        }
        Commands::FindDuplicates { limit } => {
            let store = pg_store(&config).await?;
            let codes: HashMap<_, _> = store
                .list_source_websites()
                .await
                .context("loading source websites")?
                .into_iter()
                .map(|w| (w.id, w.code))
                .collect();
            let report = scan_duplicates(&*store).await?;

            println!(
                "{} listings scanned, {} candidate pairs",
                report.total_listings,
                report.pairs.len()
            );
            for (reason, count) in report.count_by_reason() {
                println!("\n{reason}: {count} pairs");
                let matching = report
                    .pairs
                    .iter()
                    .filter(|p| p.reason.label() == reason)
                    .take(limit);
                for pair in matching {
                    print_side("1", &pair.first, &codes);
                    print_side("2", &pair.second, &codes);
                    println!(
                        "  price diff: {} EUR, area diff: {}, title similarity: {:.2}, cross-source: {}",
                        pair.price_diff_cents / 100,
                        pair.area_diff_sqm
                            .map(|d| format!("{d} sqm"))
                            .unwrap_or_else(|| "n/a".to_string()),
                        pair.title_similarity,
                        pair.cross_source
                    );
                }
            }
            println!(
                "\nunique listings involved: {}, cross-source pairs: {}",
                report.unique_listings, report.cross_source_pairs
            );
        }
    }

    Ok(())
}

async fn pg_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let pg_config = PgStoreConfig {
        max_connections: config.max_db_connections,
        ..PgStoreConfig::new(config.database_url.clone())
    };
    let store = PgStore::connect(&pg_config)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

fn print_side(label: &str, side: &DuplicateSide, codes: &HashMap<Uuid, String>) {
    let sources = side
        .sources
        .iter()
        .map(|s| {
            let code = codes
                .get(&s.source_website_id)
                .map(String::as_str)
                .unwrap_or("?");
            format!("{code}:{}", s.source_listing_id)
        })
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "  listing {label} {}: {} | {} EUR | {} sqm | rooms {} | {} - {} | ref {} | {}",
        side.listing_id,
        side.title.chars().take(60).collect::<String>(),
        side.price_monthly_cents / 100,
        side.total_area_sqm.map(|a| a.to_string()).unwrap_or_else(|| "?".into()),
        side.rooms.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
        side.district.as_deref().unwrap_or("?"),
        side.building_name.as_deref().unwrap_or("?"),
        side.reference_code_normalized.as_deref().unwrap_or("n/a"),
        sources
    );
}
