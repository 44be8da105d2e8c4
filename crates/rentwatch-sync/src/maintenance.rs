//! Operator tasks around the canonical store: seeding, score backfill, the
//! daily new-listing summary and a read-only duplicate scan.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rentwatch_core::{
    reference_base_prefix, score_listing, ContractType, Listing, ListingSource, SourceWebsite,
};
use rentwatch_storage::ListingStore;
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SourceRegistry;

/// Upsert every enabled registry entry by code. Safe to run repeatedly.
pub async fn seed_source_websites(
    store: &dyn ListingStore,
    registry: &SourceRegistry,
) -> Result<Vec<SourceWebsite>> {
    let mut seeded = Vec::new();
    for source in registry.enabled() {
        let website = store
            .upsert_source_website(&source.to_new_website())
            .await
            .with_context(|| format!("seeding source website {}", source.code))?;
        info!(code = %website.code, id = %website.id, "source website seeded");
        seeded.push(website);
    }
    Ok(seeded)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub total: usize,
    pub updated: usize,
    pub errors: usize,
    /// Score to number of listings holding it.
    pub distribution: BTreeMap<i32, usize>,
}

/// Recompute and persist the score of every rental listing.
pub async fn backfill_scores(store: &dyn ListingStore) -> Result<BackfillReport> {
    let rentals: Vec<Listing> = store
        .all_listings()
        .await
        .context("loading listings for score backfill")?
        .into_iter()
        .filter(|l| l.contract_type == ContractType::Rent)
        .collect();

    let mut report = BackfillReport {
        total: rentals.len(),
        ..BackfillReport::default()
    };
    info!(total = report.total, "backfilling rental scores");

    for listing in &rentals {
        let score = score_listing(listing);
        match store.update_score(listing.id, score).await {
            Ok(()) => {
                report.updated += 1;
                *report.distribution.entry(score).or_default() += 1;
                if report.updated % 10 == 0 {
                    info!(updated = report.updated, total = report.total, "backfill progress");
                }
            }
            Err(err) => {
                report.errors += 1;
                warn!(listing_id = %listing.id, title = %listing.title, error = %err, "failed to update score");
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateReason {
    SameReferenceCode,
    SimilarReferenceCode,
    SameUnitWithoutReference,
}

impl DuplicateReason {
    pub fn label(&self) -> &'static str {
        match self {
            DuplicateReason::SameReferenceCode => "same_reference_code",
            DuplicateReason::SimilarReferenceCode => "similar_reference_code",
            DuplicateReason::SameUnitWithoutReference => "same_unit_without_reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    pub source_website_id: Uuid,
    pub source_listing_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateSide {
    pub listing_id: Uuid,
    pub title: String,
    pub price_monthly_cents: i64,
    pub total_area_sqm: Option<f64>,
    pub terrace_area_sqm: Option<f64>,
    pub rooms: Option<i32>,
    pub district: Option<String>,
    pub building_name: Option<String>,
    pub reference_code_normalized: Option<String>,
    pub primary_url: Option<String>,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicatePair {
    pub reason: DuplicateReason,
    pub first: DuplicateSide,
    pub second: DuplicateSide,
    pub price_diff_cents: i64,
    pub area_diff_sqm: Option<f64>,
    pub title_similarity: f64,
    /// No source website observes both listings.
    pub cross_source: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub total_listings: usize,
    pub pairs: Vec<DuplicatePair>,
    pub unique_listings: usize,
    pub cross_source_pairs: usize,
}

impl DuplicateReport {
    pub fn count_by_reason(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for pair in &self.pairs {
            *counts.entry(pair.reason.label()).or_default() += 1;
        }
        counts
    }
}

/// Load everything from the store and run [`find_duplicate_candidates`].
pub async fn scan_duplicates(store: &dyn ListingStore) -> Result<DuplicateReport> {
    let listings = store.all_listings().await.context("loading listings")?;
    let sources = store
        .all_listing_sources()
        .await
        .context("loading listing sources")?;
    Ok(find_duplicate_candidates(&listings, &sources))
}

/// Pairwise scan for listings that probably describe the same unit.
///
/// Each pair is classified by the first rule that fires. Listings are compared
/// in ascending price order.
pub fn find_duplicate_candidates(listings: &[Listing], sources: &[ListingSource]) -> DuplicateReport {
    let mut by_listing: HashMap<Uuid, Vec<&ListingSource>> = HashMap::new();
    for source in sources {
        by_listing.entry(source.listing_id).or_default().push(source);
    }

    let mut ordered: Vec<&Listing> = listings.iter().collect();
    ordered.sort_by_key(|l| l.price_monthly_cents);

    let mut pairs = Vec::new();
    for (i, a) in ordered.iter().enumerate() {
        for b in &ordered[i + 1..] {
            if a.id == b.id {
                continue;
            }
            let Some(reason) = classify_pair(a, b) else {
                continue;
            };
            let a_sources = by_listing.get(&a.id).map(Vec::as_slice).unwrap_or_default();
            let b_sources = by_listing.get(&b.id).map(Vec::as_slice).unwrap_or_default();
            let cross_source = !a_sources.iter().any(|sa| {
                b_sources
                    .iter()
                    .any(|sb| sa.source_website_id == sb.source_website_id)
            });
            pairs.push(DuplicatePair {
                reason,
                first: side(a, a_sources),
                second: side(b, b_sources),
                price_diff_cents: (a.price_monthly_cents - b.price_monthly_cents).abs(),
                area_diff_sqm: area_diff(a, b),
                title_similarity: jaro_winkler(&a.title.to_lowercase(), &b.title.to_lowercase()),
                cross_source,
            });
        }
    }

    let unique_listings = pairs
        .iter()
        .flat_map(|p| [p.first.listing_id, p.second.listing_id])
        .collect::<HashSet<_>>()
        .len();
    let cross_source_pairs = pairs.iter().filter(|p| p.cross_source).count();
    DuplicateReport {
        total_listings: listings.len(),
        pairs,
        unique_listings,
        cross_source_pairs,
    }
}

fn classify_pair(a: &Listing, b: &Listing) -> Option<DuplicateReason> {
    let price_diff = (a.price_monthly_cents - b.price_monthly_cents).abs();
    let area = area_diff(a, b);

    if let (Some(ref_a), Some(ref_b)) = (
        a.reference_code_normalized.as_deref(),
        b.reference_code_normalized.as_deref(),
    ) {
        if ref_a == ref_b {
            return Some(DuplicateReason::SameReferenceCode);
        }
        let base_a = reference_base_prefix(ref_a).unwrap_or_else(|| ref_a.to_string());
        let base_b = reference_base_prefix(ref_b).unwrap_or_else(|| ref_b.to_string());
        if base_a == base_b
            && base_a.len() > 5
            && price_diff <= 10_000
            && area.map_or(true, |d| d <= 5.0)
        {
            return Some(DuplicateReason::SimilarReferenceCode);
        }
    }

    let same_known = |x: &Option<String>, y: &Option<String>| x.is_some() && x == y;
    if price_diff <= 100
        && area.is_some_and(|d| d <= 2.0)
        && a.rooms.is_some()
        && a.rooms == b.rooms
        && same_known(&a.district, &b.district)
        && same_known(&a.building_name, &b.building_name)
        && (a.reference_code_normalized.is_none() || b.reference_code_normalized.is_none())
    {
        return Some(DuplicateReason::SameUnitWithoutReference);
    }
    None
}

/// Zero areas count as unknown here.
fn area_diff(a: &Listing, b: &Listing) -> Option<f64> {
    match (
        a.total_area_sqm.filter(|v| *v != 0.0),
        b.total_area_sqm.filter(|v| *v != 0.0),
    ) {
        (Some(x), Some(y)) => Some((x - y).abs()),
        _ => None,
    }
}

fn side(listing: &Listing, sources: &[&ListingSource]) -> DuplicateSide {
    DuplicateSide {
        listing_id: listing.id,
        title: listing.title.clone(),
        price_monthly_cents: listing.price_monthly_cents,
        total_area_sqm: listing.total_area_sqm,
        terrace_area_sqm: listing.terrace_area_sqm,
        rooms: listing.rooms,
        district: listing.district.clone(),
        building_name: listing.building_name.clone(),
        reference_code_normalized: listing.reference_code_normalized.clone(),
        primary_url: listing.primary_url.clone(),
        sources: sources
            .iter()
            .map(|s| SourceRef {
                source_website_id: s.source_website_id,
                source_listing_id: s.source_listing_id.clone(),
            })
            .collect(),
    }
}

/// Zone whose calendar day bounds the daily summary.
pub const SUMMARY_TIMEZONE: Tz = chrono_tz::Europe::Paris;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomCount {
    pub rooms: Option<i32>,
    pub count: usize,
}

/// New listings first seen on one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total: usize,
    /// Ascending room count, unknown last.
    pub by_rooms: Vec<RoomCount>,
}

impl DailySummary {
    pub fn date_label(&self) -> String {
        self.date.format("%d/%m/%Y").to_string()
    }
}

/// Summary of listings first seen on the current day in [`SUMMARY_TIMEZONE`].
pub async fn today_summary(store: &dyn ListingStore, now: DateTime<Utc>) -> Result<DailySummary> {
    let today = now.with_timezone(&SUMMARY_TIMEZONE).date_naive();
    let listings = store
        .all_listings()
        .await
        .context("loading listings for daily summary")?;
    let summary = summarize_day(&listings, today, SUMMARY_TIMEZONE);
    info!(date = %summary.date, total = summary.total, "daily summary computed");
    Ok(summary)
}

pub fn summarize_day(listings: &[Listing], day: NaiveDate, tz: Tz) -> DailySummary {
    let mut counts: HashMap<Option<i32>, usize> = HashMap::new();
    let mut total = 0;
    for listing in listings {
        if listing.first_seen_at.with_timezone(&tz).date_naive() == day {
            *counts.entry(listing.rooms).or_default() += 1;
            total += 1;
        }
    }

    let mut by_rooms: Vec<RoomCount> = counts
        .into_iter()
        .map(|(rooms, count)| RoomCount { rooms, count })
        .collect();
    by_rooms.sort_by_key(|c| (c.rooms.is_none(), c.rooms));

    DailySummary {
        date: day,
        total,
        by_rooms,
    }
}
