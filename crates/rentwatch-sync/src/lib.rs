//! Identity resolution and upsert orchestration for rentwatch.
//!
//! [`UpsertEngine`] turns one parsed listing into either a new canonical
//! listing or a merge into an existing one, and records where it was seen.
//! [`IngestRunner`] drives the engine over a batch file, one worker per site.

pub mod batch;
pub mod config;
pub mod engine;
pub mod maintenance;
pub mod matcher;
pub mod merge;

pub use batch::{load_records, parse_records, IngestRunner, IngestSummary, NewListingAlert};
pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use engine::{UpsertEngine, UpsertError, UpsertResult};
pub use maintenance::{
    backfill_scores, find_duplicate_candidates, scan_duplicates, seed_source_websites,
    summarize_day, today_summary, BackfillReport, DailySummary, DuplicatePair, DuplicateReason,
    DuplicateReport, RoomCount,
};
pub use matcher::{MatchDecision, Matcher, Tolerances};

pub const CRATE_NAME: &str = "rentwatch-sync";
