//! Canonical store contract for rentwatch plus its in-memory and Postgres backends.
//!
//! The store's uniqueness constraints (listing fingerprint, listing reference
//! code, and the per-website source listing id) are what coordinate concurrent
//! writers; callers never hold locks across a record's cascade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rentwatch_core::{Listing, ListingSource, SourceWebsite};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

pub const CRATE_NAME: &str = "rentwatch-storage";

/// Unique keys enforced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniqueKey {
    ListingFingerprint,
    ListingReferenceCode,
    SourceListing,
    SourceWebsiteCode,
}

impl UniqueKey {
    /// Constraint name used by the Postgres schema in `migrations/`.
    pub fn constraint_name(&self) -> &'static str {
        match self {
            UniqueKey::ListingFingerprint => "listings_fingerprint_key",
            UniqueKey::ListingReferenceCode => "listings_reference_code_normalized_key",
            UniqueKey::SourceListing => "listing_sources_source_website_id_source_listing_id_key",
            UniqueKey::SourceWebsiteCode => "source_websites_code_key",
        }
    }

    pub fn from_constraint_name(name: &str) -> Option<Self> {
        [
            UniqueKey::ListingFingerprint,
            UniqueKey::ListingReferenceCode,
            UniqueKey::SourceListing,
            UniqueKey::SourceWebsiteCode,
        ]
        .into_iter()
        .find(|key| key.constraint_name() == name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {}", .0.constraint_name())]
    UniqueViolation(UniqueKey),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_unique_violation_on(&self, key: UniqueKey) -> bool {
        matches!(self, StoreError::UniqueViolation(k) if *k == key)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Source website row as written by seeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSourceWebsite {
    pub code: String,
    pub name: String,
    pub base_url: String,
}

/// Provenance observation to upsert, keyed by website + source listing id.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingSourceUpsert {
    pub listing_id: Uuid,
    pub source_website_id: Uuid,
    pub source_listing_id: String,
    pub url: String,
    pub source_reference_code: Option<String>,
    pub source_reference_code_normalized: Option<String>,
    pub source_title: Option<String>,
    pub raw_payload: serde_json::Value,
    pub seen_at: DateTime<Utc>,
}

/// Candidate filter for the structural (building + size + rooms) lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralQuery {
    pub building_name: String,
    pub rooms: i32,
    pub total_area_min_sqm: f64,
    pub total_area_max_sqm: f64,
    pub district: Option<String>,
}

impl StructuralQuery {
    pub fn matches(&self, listing: &Listing) -> bool {
        listing.building_name.as_deref() == Some(self.building_name.as_str())
            && listing.rooms == Some(self.rooms)
            && listing.total_area_sqm.is_some_and(|area| {
                area >= self.total_area_min_sqm && area <= self.total_area_max_sqm
            })
            && self
                .district
                .as_deref()
                .map_or(true, |district| listing.district.as_deref() == Some(district))
    }
}

/// Read/write contract the upsert engine needs from the canonical store.
///
/// Multi-row lookups return rows in first-seen order so cascade tie-breaks are
/// stable across backends.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_source_website(&self, code: &str) -> StoreResult<Option<SourceWebsite>>;

    async fn upsert_source_website(&self, website: &NewSourceWebsite) -> StoreResult<SourceWebsite>;

    async fn list_source_websites(&self) -> StoreResult<Vec<SourceWebsite>>;

    async fn find_listing_source(
        &self,
        source_website_id: Uuid,
        source_listing_id: &str,
    ) -> StoreResult<Option<ListingSource>>;

    async fn sources_for_listing(&self, listing_id: Uuid) -> StoreResult<Vec<ListingSource>>;

    async fn all_listing_sources(&self) -> StoreResult<Vec<ListingSource>>;

    async fn find_listing(&self, id: Uuid) -> StoreResult<Option<Listing>>;

    async fn find_by_reference_code(&self, normalized: &str) -> StoreResult<Option<Listing>>;

    /// Listings whose normalized reference code starts with `<prefix>_`.
    async fn find_by_reference_prefix(&self, prefix: &str) -> StoreResult<Vec<Listing>>;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Listing>>;

    async fn find_structural_candidates(&self, query: &StructuralQuery) -> StoreResult<Vec<Listing>>;

    async fn all_listings(&self) -> StoreResult<Vec<Listing>>;

    /// Insert a new listing. Fails with [`StoreError::UniqueViolation`] when the
    /// fingerprint or reference code is already taken.
    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()>;

    /// Overwrite the mutable columns of an existing listing. Keys and
    /// `first_seen_at` are left untouched.
    async fn update_listing(&self, listing: &Listing) -> StoreResult<()>;

    async fn update_score(&self, listing_id: Uuid, score: i32) -> StoreResult<()>;

    async fn upsert_listing_source(&self, source: &ListingSourceUpsert) -> StoreResult<ListingSource>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_names_round_trip() {
        for key in [
            UniqueKey::ListingFingerprint,
            UniqueKey::ListingReferenceCode,
            UniqueKey::SourceListing,
            UniqueKey::SourceWebsiteCode,
        ] {
            assert_eq!(UniqueKey::from_constraint_name(key.constraint_name()), Some(key));
        }
        assert_eq!(UniqueKey::from_constraint_name("listings_pkey"), None);
    }

    #[test]
    fn unique_violation_display_names_the_constraint() {
        let err = StoreError::UniqueViolation(UniqueKey::ListingFingerprint);
        assert_eq!(
            err.to_string(),
            "unique constraint violated: listings_fingerprint_key"
        );
        assert!(err.is_unique_violation_on(UniqueKey::ListingFingerprint));
        assert!(!err.is_unique_violation_on(UniqueKey::ListingReferenceCode));
    }
}
