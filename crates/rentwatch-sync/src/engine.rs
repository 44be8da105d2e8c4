//! Per-record upsert: resolve, then create or merge, then record provenance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rentwatch_core::{disambiguated_fingerprint, Listing, MatchStrategy, ParsedListing, UpsertOutcome};
use rentwatch_storage::{ListingSourceUpsert, ListingStore, StoreError, UniqueKey};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::matcher::{MatchDecision, MatchInput, Matcher, ResolvedMatch, Tolerances};
use crate::merge::{merge_listing, new_listing, ListingKeys};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("unknown source website `{0}`")]
    UnknownSourceWebsite(String),
    #[error("fingerprint `{fingerprint}` is taken but no listing could be read back")]
    UnresolvedFingerprintConflict { fingerprint: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type UpsertResult<T> = Result<T, UpsertError>;

/// Stateless apart from the shared store handle; safe to share across workers.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn ListingStore>,
    tolerances: Tolerances,
}

struct Persisted {
    listing: Listing,
    created: bool,
    matched_by: Option<MatchStrategy>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            tolerances: Tolerances::default(),
        }
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub async fn upsert(&self, record: &ParsedListing) -> UpsertResult<UpsertOutcome> {
        let span = info_span!(
            "upsert_listing",
            source = %record.source_website_code,
            source_listing_id = %record.source_listing_id,
        );
        self.upsert_inner(record).instrument(span).await
    }

    async fn upsert_inner(&self, record: &ParsedListing) -> UpsertResult<UpsertOutcome> {
        let website = self
            .store
            .find_source_website(&record.source_website_code)
            .await?
            .ok_or_else(|| UpsertError::UnknownSourceWebsite(record.source_website_code.clone()))?;

        let input = MatchInput::new(record, website.id);
        let decision = Matcher::new(self.store.as_ref(), self.tolerances)
            .resolve(&input)
            .await?;

        let now = Utc::now();
        let persisted = match decision.resolved.clone() {
            Some(ResolvedMatch { listing, strategy }) => Persisted {
                listing: self.merge_into(&listing, record, now).await?,
                created: false,
                matched_by: Some(strategy),
            },
            None => self.create(record, &input, &decision, now).await?,
        };

        let source = self
            .store
            .upsert_listing_source(&ListingSourceUpsert {
                listing_id: persisted.listing.id,
                source_website_id: website.id,
                source_listing_id: record.source_listing_id.clone(),
                url: record.url.clone(),
                source_reference_code: record.reference_raw.clone().filter(|r| !r.is_empty()),
                source_reference_code_normalized: input.reference_normalized.clone(),
                source_title: Some(record.title.clone()),
                raw_payload: record
                    .raw_payload
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
                seen_at: now,
            })
            .await?;

        info!(
            listing_id = %persisted.listing.id,
            created = persisted.created,
            matched_by = persisted.matched_by.map(|s| s.as_str()).unwrap_or("NEW"),
            score = persisted.listing.score,
            "listing upserted"
        );

        Ok(UpsertOutcome {
            listing_id: persisted.listing.id,
            listing_source_id: source.id,
            created_new_listing: persisted.created,
            score: persisted.listing.score,
            price_monthly_cents: persisted.listing.price_monthly_cents,
            matched_by: persisted.matched_by,
        })
    }

    async fn merge_into(
        &self,
        existing: &Listing,
        record: &ParsedListing,
        now: DateTime<Utc>,
    ) -> UpsertResult<Listing> {
        let merged = merge_listing(existing, record, now);
        self.store.update_listing(&merged).await?;
        Ok(merged)
    }

    /// Insert once; on a fingerprint collision with a concurrent writer, read
    /// the winner back (attempted key, then the disambiguated one) and merge.
    async fn create(
        &self,
        record: &ParsedListing,
        input: &MatchInput<'_>,
        decision: &MatchDecision,
        now: DateTime<Utc>,
    ) -> UpsertResult<Persisted> {
        let fallback = disambiguated_fingerprint(&input.fingerprint, &record.source_listing_id);
        let fingerprint = if decision.fingerprint_usable {
            input.fingerprint.clone()
        } else {
            fallback.clone()
        };
        let keys = ListingKeys {
            fingerprint: fingerprint.clone(),
            reference_code_normalized: input
                .reference_normalized
                .clone()
                .filter(|_| decision.reference_code_usable),
        };
        let listing = new_listing(record, keys, now);

        match self.store.insert_listing(&listing).await {
            Ok(()) => Ok(Persisted {
                listing,
                created: true,
                matched_by: None,
            }),
            Err(err) if err.is_unique_violation_on(UniqueKey::ListingFingerprint) => {
                warn!(%fingerprint, "fingerprint taken by a concurrent writer; reading it back");
                let existing = match self.store.find_by_fingerprint(&fingerprint).await? {
                    Some(found) => Some(found),
                    None => self.store.find_by_fingerprint(&fallback).await?,
                };
                let Some(existing) = existing else {
                    return Err(UpsertError::UnresolvedFingerprintConflict { fingerprint });
                };
                Ok(Persisted {
                    listing: self.merge_into(&existing, record, now).await?,
                    created: false,
                    matched_by: Some(MatchStrategy::FingerprintConflict),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}
