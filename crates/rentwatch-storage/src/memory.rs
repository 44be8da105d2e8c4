use std::collections::HashMap;

use async_trait::async_trait;
use rentwatch_core::{Listing, ListingSource, SourceWebsite};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ListingSourceUpsert, ListingStore, NewSourceWebsite, StoreError, StoreResult, StructuralQuery,
    UniqueKey,
};

/// In-process store with the same uniqueness guarantees as the Postgres schema.
///
/// Rows are kept in insertion order, which stands in for first-seen order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    websites: Vec<SourceWebsite>,
    listings: Vec<Listing>,
    sources: Vec<ListingSource>,
    listing_index: HashMap<Uuid, usize>,
}

impl MemoryState {
    fn listing_mut(&mut self, id: Uuid) -> StoreResult<&mut Listing> {
        let idx = *self
            .listing_index
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "listing", id })?;
        Ok(&mut self.listings[idx])
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }

    pub async fn listing_source_count(&self) -> usize {
        self.state.lock().await.sources.len()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn find_source_website(&self, code: &str) -> StoreResult<Option<SourceWebsite>> {
        let state = self.state.lock().await;
        Ok(state.websites.iter().find(|w| w.code == code).cloned())
    }

    async fn upsert_source_website(&self, website: &NewSourceWebsite) -> StoreResult<SourceWebsite> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.websites.iter_mut().find(|w| w.code == website.code) {
            existing.name = website.name.clone();
            existing.base_url = website.base_url.clone();
            return Ok(existing.clone());
        }
        let row = SourceWebsite {
            id: Uuid::new_v4(),
            code: website.code.clone(),
            name: website.name.clone(),
            base_url: website.base_url.clone(),
        };
        state.websites.push(row.clone());
        Ok(row)
    }

    async fn list_source_websites(&self) -> StoreResult<Vec<SourceWebsite>> {
        Ok(self.state.lock().await.websites.clone())
    }

    async fn find_listing_source(
        &self,
        source_website_id: Uuid,
        source_listing_id: &str,
    ) -> StoreResult<Option<ListingSource>> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .iter()
            .find(|s| s.is_observation_of(source_website_id, source_listing_id))
            .cloned())
    }

    async fn sources_for_listing(&self, listing_id: Uuid) -> StoreResult<Vec<ListingSource>> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .iter()
            .filter(|s| s.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn all_listing_sources(&self) -> StoreResult<Vec<ListingSource>> {
        Ok(self.state.lock().await.sources.clone())
    }

    async fn find_listing(&self, id: Uuid) -> StoreResult<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state.listing_index.get(&id).map(|&idx| state.listings[idx].clone()))
    }

    async fn find_by_reference_code(&self, normalized: &str) -> StoreResult<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .find(|l| l.reference_code_normalized.as_deref() == Some(normalized))
            .cloned())
    }

    async fn find_by_reference_prefix(&self, prefix: &str) -> StoreResult<Vec<Listing>> {
        let needle = format!("{prefix}_");
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .filter(|l| {
                l.reference_code_normalized
                    .as_deref()
                    .is_some_and(|code| code.starts_with(&needle))
            })
            .cloned()
            .collect())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .find(|l| l.fingerprint == fingerprint)
            .cloned())
    }

    async fn find_structural_candidates(&self, query: &StructuralQuery) -> StoreResult<Vec<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .filter(|l| query.matches(l))
            .cloned()
            .collect())
    }

    async fn all_listings(&self) -> StoreResult<Vec<Listing>> {
        Ok(self.state.lock().await.listings.clone())
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.listings.iter().any(|l| l.fingerprint == listing.fingerprint) {
            return Err(StoreError::UniqueViolation(UniqueKey::ListingFingerprint));
        }
        if let Some(code) = listing.reference_code_normalized.as_deref() {
            if state
                .listings
                .iter()
                .any(|l| l.reference_code_normalized.as_deref() == Some(code))
            {
                return Err(StoreError::UniqueViolation(UniqueKey::ListingReferenceCode));
            }
        }
        let idx = state.listings.len();
        state.listing_index.insert(listing.id, idx);
        state.listings.push(listing.clone());
        Ok(())
    }

    async fn update_listing(&self, listing: &Listing) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let row = state.listing_mut(listing.id)?;
        let fingerprint = std::mem::take(&mut row.fingerprint);
        let reference_code_normalized = row.reference_code_normalized.take();
        let first_seen_at = row.first_seen_at;
        *row = Listing {
            fingerprint,
            reference_code_normalized,
            first_seen_at,
            ..listing.clone()
        };
        Ok(())
    }

    async fn update_score(&self, listing_id: Uuid, score: i32) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.listing_mut(listing_id)?.score = Some(score);
        Ok(())
    }

    async fn upsert_listing_source(&self, source: &ListingSourceUpsert) -> StoreResult<ListingSource> {
        let mut state = self.state.lock().await;
        if !state.listing_index.contains_key(&source.listing_id) {
            return Err(StoreError::NotFound {
                entity: "listing",
                id: source.listing_id,
            });
        }

        if let Some(existing) = state
            .sources
            .iter_mut()
            .find(|s| s.is_observation_of(source.source_website_id, &source.source_listing_id))
        {
            existing.listing_id = source.listing_id;
            existing.url = source.url.clone();
            existing.source_reference_code = source.source_reference_code.clone();
            existing.source_reference_code_normalized =
                source.source_reference_code_normalized.clone();
            existing.source_title = source.source_title.clone();
            existing.raw_payload = source.raw_payload.clone();
            existing.last_seen_at = source.seen_at;
            existing.is_active_on_source = true;
            return Ok(existing.clone());
        }

        let row = ListingSource {
            id: Uuid::new_v4(),
            listing_id: source.listing_id,
            source_website_id: source.source_website_id,
            source_listing_id: source.source_listing_id.clone(),
            url: source.url.clone(),
            source_reference_code: source.source_reference_code.clone(),
            source_reference_code_normalized: source.source_reference_code_normalized.clone(),
            source_title: source.source_title.clone(),
            raw_payload: source.raw_payload.clone(),
            first_seen_at: source.seen_at,
            last_seen_at: source.seen_at,
            is_active_on_source: true,
        };
        state.sources.push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rentwatch_core::{Condition, ContractType, PropertyType};

    fn listing(fingerprint: &str, reference: Option<&str>) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.to_string(),
            reference_code: reference.map(str::to_string),
            reference_code_normalized: reference.map(str::to_string),
            title: "Test".into(),
            city: "Monaco".into(),
            district: Some("Larvotto".into()),
            building_name: Some("Le Millefiori".into()),
            address: None,
            contract_type: ContractType::Rent,
            property_type: PropertyType::Apartment,
            price_monthly_cents: 800_000,
            currency: "EUR".into(),
            service_charges_monthly_cents: None,
            service_charges_included: None,
            rooms: Some(3),
            bedrooms: Some(2),
            bathrooms: None,
            total_area_sqm: Some(120.0),
            living_area_sqm: None,
            terrace_area_sqm: None,
            floor: None,
            parking_spaces: None,
            cellars: None,
            is_mixed_use: None,
            has_rooftop: None,
            has_terrace: None,
            has_sea_view: None,
            has_elevator: None,
            has_concierge: None,
            has_ac: None,
            condition: Condition::Unknown,
            interior_condition: None,
            features_tags: vec![],
            description: None,
            description_lang: None,
            agency_name: None,
            agency_address: None,
            agency_phone: None,
            agency_email: None,
            agency_website: None,
            primary_url: None,
            all_urls: vec![],
            image_urls: vec![],
            score: None,
            first_seen_at: now,
            last_seen_at: now,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn insert_enforces_fingerprint_and_reference_uniqueness() {
        let store = MemoryStore::new();
        store.insert_listing(&listing("fp-a", Some("REF_1"))).await.unwrap();

        let err = store.insert_listing(&listing("fp-a", None)).await.unwrap_err();
        assert!(err.is_unique_violation_on(UniqueKey::ListingFingerprint));

        let err = store
            .insert_listing(&listing("fp-b", Some("REF_1")))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation_on(UniqueKey::ListingReferenceCode));

        store.insert_listing(&listing("fp-c", None)).await.unwrap();
        store.insert_listing(&listing("fp-d", None)).await.unwrap();
        assert_eq!(store.listing_count().await, 3);
    }

    #[tokio::test]
    async fn prefix_lookup_requires_separator() {
        let store = MemoryStore::new();
        store.insert_listing(&listing("a", Some("ACL_2P_AZUR_9"))).await.unwrap();
        store.insert_listing(&listing("b", Some("ACL_2P_AZURE"))).await.unwrap();
        store.insert_listing(&listing("c", Some("ACL_2P_AZUR_12"))).await.unwrap();

        let found = store.find_by_reference_prefix("ACL_2P_AZUR").await.unwrap();
        let codes = found
            .iter()
            .filter_map(|l| l.reference_code_normalized.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["ACL_2P_AZUR_9", "ACL_2P_AZUR_12"]);
    }

    #[tokio::test]
    async fn update_listing_preserves_keys_and_first_seen() {
        let store = MemoryStore::new();
        let original = listing("fp-a", Some("REF_1"));
        store.insert_listing(&original).await.unwrap();

        let mut changed = original.clone();
        changed.fingerprint = "tampered".into();
        changed.reference_code_normalized = None;
        changed.first_seen_at = original.first_seen_at + chrono::Duration::days(3);
        changed.price_monthly_cents = 810_000;
        store.update_listing(&changed).await.unwrap();

        let stored = store.find_listing(original.id).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, "fp-a");
        assert_eq!(stored.reference_code_normalized.as_deref(), Some("REF_1"));
        assert_eq!(stored.first_seen_at, original.first_seen_at);
        assert_eq!(stored.price_monthly_cents, 810_000);
    }

    #[tokio::test]
    async fn listing_source_upsert_repoints_existing_row() {
        let store = MemoryStore::new();
        let website = store
            .upsert_source_website(&NewSourceWebsite {
                code: "CIM".into(),
                name: "Chambre Immobilière de Monaco".into(),
                base_url: "https://www.chambre-immobiliere-monaco.mc".into(),
            })
            .await
            .unwrap();
        let first = listing("fp-a", None);
        let second = listing("fp-b", None);
        store.insert_listing(&first).await.unwrap();
        store.insert_listing(&second).await.unwrap();

        let mut upsert = ListingSourceUpsert {
            listing_id: first.id,
            source_website_id: website.id,
            source_listing_id: "4411".into(),
            url: "https://example.mc/4411".into(),
            source_reference_code: None,
            source_reference_code_normalized: None,
            source_title: Some("Test".into()),
            raw_payload: serde_json::json!({}),
            seen_at: Utc::now(),
        };
        let created = store.upsert_listing_source(&upsert).await.unwrap();

        upsert.listing_id = second.id;
        let updated = store.upsert_listing_source(&upsert).await.unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.listing_id, second.id);
        assert_eq!(created.first_seen_at, updated.first_seen_at);
        assert_eq!(store.listing_source_count().await, 1);
    }
}
