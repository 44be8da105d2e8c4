//! Identity resolution cascade.
//!
//! Each step looks for an existing canonical listing for an incoming record.
//! Steps run in a fixed order and the first one that resolves wins; steps that
//! find a candidate but reject it on verification mark the corresponding key
//! (reference code or fingerprint) as unsafe to claim on create.

use rentwatch_core::{
    build_fingerprint, normalize_reference, reference_base_prefix, Listing, MatchStrategy,
    ParsedListing,
};
use rentwatch_storage::{ListingStore, StoreResult, StructuralQuery};
use tracing::debug;
use uuid::Uuid;

/// Match verification thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    /// Maximum monthly price difference, in minor units.
    pub price_cents: i64,
    /// Maximum total or livable area difference.
    pub area_sqm: f64,
    /// Maximum terrace difference for structural matches.
    pub terrace_sqm: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            price_cents: 10_000,
            area_sqm: 5.0,
            terrace_sqm: 5.0,
        }
    }
}

impl Tolerances {
    pub fn price_matches(&self, a: i64, b: i64) -> bool {
        (a == 0 && b == 0) || (a - b).abs() <= self.price_cents
    }

    /// Both unknown counts as a match, one unknown does not.
    pub fn optional_area_matches(&self, a: Option<f64>, b: Option<f64>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => (a - b).abs() <= self.area_sqm,
            _ => false,
        }
    }

    /// Total area or total-minus-terrace agrees; sites disagree on whether the
    /// terrace is part of the advertised surface.
    pub fn area_matches(&self, incoming: &ParsedListing, candidate: &Listing) -> bool {
        let incoming_livable = incoming
            .total_area_sqm
            .map(|total| total - incoming.terrace_area_sqm.unwrap_or(0.0));
        self.optional_area_matches(incoming.total_area_sqm, candidate.total_area_sqm)
            || self.optional_area_matches(incoming_livable, candidate.livable_area_by_total())
    }

    /// Price plus area verification used for reference-code candidates.
    pub fn same_unit(&self, incoming: &ParsedListing, candidate: &Listing) -> bool {
        self.price_matches(incoming.price_monthly_cents, candidate.price_monthly_cents)
            && self.area_matches(incoming, candidate)
    }

    /// Fingerprint candidates must also agree on a known room count.
    pub fn same_unit_with_rooms(&self, incoming: &ParsedListing, candidate: &Listing) -> bool {
        self.same_unit(incoming, candidate)
            && incoming.rooms.is_some()
            && incoming.rooms == candidate.rooms
    }

    /// Structural verification: both total areas known and close, terraces
    /// close when both sides report one.
    pub fn structural_match(&self, incoming: &ParsedListing, candidate: &Listing) -> bool {
        let area_ok = match (nonzero(incoming.total_area_sqm), nonzero(candidate.total_area_sqm)) {
            (Some(a), Some(b)) => (a - b).abs() <= self.area_sqm,
            _ => false,
        };
        let terrace_ok = match (
            nonzero(incoming.terrace_area_sqm),
            nonzero(candidate.terrace_area_sqm),
        ) {
            (Some(a), Some(b)) => (a - b).abs() <= self.terrace_sqm,
            _ => true,
        };
        self.price_matches(incoming.price_monthly_cents, candidate.price_monthly_cents)
            && area_ok
            && terrace_ok
    }
}

fn nonzero(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v != 0.0)
}

/// The listing a record resolved to, and which step found it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMatch {
    pub listing: Listing,
    pub strategy: MatchStrategy,
}

/// Final cascade output. Key flags are only ever cleared, never set back.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub resolved: Option<ResolvedMatch>,
    pub reference_code_usable: bool,
    pub fingerprint_usable: bool,
}

impl MatchDecision {
    fn unresolved() -> Self {
        Self {
            resolved: None,
            reference_code_usable: true,
            fingerprint_usable: true,
        }
    }

    fn resolved_by(self, listing: Listing, strategy: MatchStrategy) -> Self {
        Self {
            resolved: Some(ResolvedMatch { listing, strategy }),
            ..self
        }
    }

    fn without_key(self, key: ContestedKey) -> Self {
        match key {
            ContestedKey::ReferenceCode => Self {
                reference_code_usable: false,
                ..self
            },
            ContestedKey::Fingerprint => Self {
                fingerprint_usable: false,
                ..self
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContestedKey {
    ReferenceCode,
    Fingerprint,
}

enum StepOutcome {
    Resolved(Listing),
    Rejected(ContestedKey),
    NoCandidate,
}

const CASCADE: [MatchStrategy; 4] = [
    MatchStrategy::SourceIdentity,
    MatchStrategy::ReferenceCode,
    MatchStrategy::Fingerprint,
    MatchStrategy::Structural,
];

/// Per-record inputs shared by every cascade step.
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    pub record: &'a ParsedListing,
    pub source_website_id: Uuid,
    pub reference_normalized: Option<String>,
    pub fingerprint: String,
}

impl<'a> MatchInput<'a> {
    pub fn new(record: &'a ParsedListing, source_website_id: Uuid) -> Self {
        Self {
            record,
            source_website_id,
            reference_normalized: normalize_reference(record.reference_raw.as_deref()),
            fingerprint: build_fingerprint(&record.fingerprint_input()),
        }
    }
}

pub struct Matcher<'s> {
    store: &'s dyn ListingStore,
    tolerances: Tolerances,
}

impl<'s> Matcher<'s> {
    pub fn new(store: &'s dyn ListingStore, tolerances: Tolerances) -> Self {
        Self { store, tolerances }
    }

    pub async fn resolve(&self, input: &MatchInput<'_>) -> StoreResult<MatchDecision> {
        let mut decision = MatchDecision::unresolved();
        for strategy in CASCADE {
            match self.run_step(strategy, input).await? {
                StepOutcome::Resolved(listing) => {
                    debug!(
                        listing_id = %listing.id,
                        strategy = %strategy,
                        source_listing_id = %input.record.source_listing_id,
                        "record resolved"
                    );
                    return Ok(decision.resolved_by(listing, strategy));
                }
                StepOutcome::Rejected(key) => {
                    debug!(?key, strategy = %strategy, "candidate rejected on verification");
                    decision = decision.without_key(key);
                }
                StepOutcome::NoCandidate => {}
            }
        }
        Ok(decision)
    }

    async fn run_step(
        &self,
        strategy: MatchStrategy,
        input: &MatchInput<'_>,
    ) -> StoreResult<StepOutcome> {
        match strategy {
            MatchStrategy::SourceIdentity => self.by_source_identity(input).await,
            MatchStrategy::ReferenceCode => self.by_reference_code(input).await,
            MatchStrategy::Fingerprint => self.by_fingerprint(input).await,
            MatchStrategy::Structural => self.by_structure(input).await,
            MatchStrategy::FingerprintConflict => Ok(StepOutcome::NoCandidate),
        }
    }

    async fn by_source_identity(&self, input: &MatchInput<'_>) -> StoreResult<StepOutcome> {
        let Some(source) = self
            .store
            .find_listing_source(input.source_website_id, &input.record.source_listing_id)
            .await?
        else {
            return Ok(StepOutcome::NoCandidate);
        };
        Ok(match self.store.find_listing(source.listing_id).await? {
            Some(listing) => StepOutcome::Resolved(listing),
            None => StepOutcome::NoCandidate,
        })
    }

    async fn by_reference_code(&self, input: &MatchInput<'_>) -> StoreResult<StepOutcome> {
        let Some(normalized) = input.reference_normalized.as_deref() else {
            return Ok(StepOutcome::NoCandidate);
        };

        let candidate = match self.store.find_by_reference_code(normalized).await? {
            Some(exact) => Some(exact),
            None => self.by_reference_prefix(normalized, input.record).await?,
        };
        let Some(candidate) = candidate else {
            return Ok(StepOutcome::NoCandidate);
        };

        if self.has_provenance(&candidate, input).await?
            || self.tolerances.same_unit(input.record, &candidate)
        {
            Ok(StepOutcome::Resolved(candidate))
        } else {
            Ok(StepOutcome::Rejected(ContestedKey::ReferenceCode))
        }
    }

    /// Fuzzy lookup for sites that suffix a shared reference with a counter,
    /// e.g. `ACL_2P_CHATEAU_AZUR_9` against `ACL_2P_CHATEAU_AZUR`.
    async fn by_reference_prefix(
        &self,
        normalized: &str,
        record: &ParsedListing,
    ) -> StoreResult<Option<Listing>> {
        let Some(prefix) = reference_base_prefix(normalized) else {
            return Ok(None);
        };
        if let Some(bare) = self.store.find_by_reference_code(&prefix).await? {
            return Ok(Some(bare));
        }

        let mut similar = self.store.find_by_reference_prefix(&prefix).await?;
        if similar.len() <= 1 {
            return Ok(similar.pop());
        }
        Ok(similar
            .into_iter()
            .find(|candidate| self.tolerances.same_unit(record, candidate)))
    }

    async fn by_fingerprint(&self, input: &MatchInput<'_>) -> StoreResult<StepOutcome> {
        let Some(candidate) = self.store.find_by_fingerprint(&input.fingerprint).await? else {
            return Ok(StepOutcome::NoCandidate);
        };
        if self.has_provenance(&candidate, input).await?
            || self.tolerances.same_unit_with_rooms(input.record, &candidate)
        {
            Ok(StepOutcome::Resolved(candidate))
        } else {
            Ok(StepOutcome::Rejected(ContestedKey::Fingerprint))
        }
    }

    async fn by_structure(&self, input: &MatchInput<'_>) -> StoreResult<StepOutcome> {
        let record = input.record;
        let (Some(building_name), Some(total), Some(rooms)) = (
            record.building_name.as_deref().filter(|b| !b.is_empty()),
            nonzero(record.total_area_sqm),
            record.rooms.filter(|r| *r != 0),
        ) else {
            return Ok(StepOutcome::NoCandidate);
        };

        let query = StructuralQuery {
            building_name: building_name.to_string(),
            rooms,
            total_area_min_sqm: total - self.tolerances.area_sqm,
            total_area_max_sqm: total + self.tolerances.area_sqm,
            district: record.district.clone().filter(|d| !d.is_empty()),
        };
        for candidate in self.store.find_structural_candidates(&query).await? {
            if self.has_provenance(&candidate, input).await? {
                continue;
            }
            if self.tolerances.structural_match(record, &candidate) {
                return Ok(StepOutcome::Resolved(candidate));
            }
        }
        Ok(StepOutcome::NoCandidate)
    }

    async fn has_provenance(&self, listing: &Listing, input: &MatchInput<'_>) -> StoreResult<bool> {
        let sources = self.store.sources_for_listing(listing.id).await?;
        Ok(sources
            .iter()
            .any(|s| s.is_observation_of(input.source_website_id, &input.record.source_listing_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rentwatch_core::{Condition, ContractType, PropertyType};
    use rentwatch_storage::{MemoryStore, NewSourceWebsite};

    fn record(id: &str, price: i64, total: Option<f64>) -> ParsedListing {
        let mut record: ParsedListing = serde_json::from_value(serde_json::json!({
            "sourceWebsiteCode": "MCRE",
            "sourceListingId": id,
            "url": format!("https://mcre.example/{id}"),
            "title": "Appartement 3 pièces",
            "city": "Monaco",
            "contractType": "RENT",
            "propertyType": "APARTMENT",
            "priceMonthlyCents": price,
        }))
        .unwrap();
        record.total_area_sqm = total;
        record
    }

    fn listing(reference: Option<&str>, fingerprint: &str, price: i64, total: Option<f64>) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.to_string(),
            reference_code: reference.map(str::to_string),
            reference_code_normalized: reference.map(str::to_string),
            title: "Existing".into(),
            city: "Monaco".into(),
            district: None,
            building_name: None,
            address: None,
            contract_type: ContractType::Rent,
            property_type: PropertyType::Apartment,
            price_monthly_cents: price,
            currency: "EUR".into(),
            service_charges_monthly_cents: None,
            service_charges_included: None,
            rooms: None,
            bedrooms: None,
            bathrooms: None,
            total_area_sqm: total,
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

    async fn website(store: &MemoryStore) -> Uuid {
        store
            .upsert_source_website(&NewSourceWebsite {
                code: "MCRE".into(),
                name: "Monte Carlo Real Estate".into(),
                base_url: "https://mcre.example".into(),
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn price_tolerance_accepts_price_on_request_pairs() {
        let t = Tolerances::default();
        assert!(t.price_matches(0, 0));
        assert!(t.price_matches(500_000, 510_000));
        assert!(!t.price_matches(500_000, 510_001));
        assert!(!t.price_matches(0, 5_000_000));
    }

    #[test]
    fn optional_area_semantics() {
        let t = Tolerances::default();
        assert!(t.optional_area_matches(None, None));
        assert!(!t.optional_area_matches(Some(80.0), None));
        assert!(t.optional_area_matches(Some(80.0), Some(85.0)));
        assert!(!t.optional_area_matches(Some(80.0), Some(85.5)));
    }

    #[test]
    fn livable_area_rescues_terrace_disagreement() {
        let t = Tolerances::default();
        let mut incoming = record("1", 800_000, Some(100.0));
        incoming.terrace_area_sqm = Some(0.0);
        let mut existing = listing(None, "fp", 800_000, Some(130.0));
        existing.terrace_area_sqm = Some(28.0);
        assert!(t.same_unit(&incoming, &existing));
    }

    #[test]
    fn structural_terrace_is_compatible_when_missing() {
        let t = Tolerances::default();
        let mut incoming = record("1", 0, Some(95.0));
        incoming.terrace_area_sqm = Some(20.0);
        let existing = listing(None, "fp", 0, Some(97.0));
        assert!(t.structural_match(&incoming, &existing));

        let mut with_terrace = existing.clone();
        with_terrace.terrace_area_sqm = Some(40.0);
        assert!(!t.structural_match(&incoming, &with_terrace));
    }

    #[tokio::test]
    async fn bare_prefix_is_preferred_over_suffixed_codes() {
        let store = MemoryStore::new();
        let website_id = website(&store).await;
        let bare = listing(Some("ACL_2P_CHATEAU_AZUR"), "fp-a", 700_000, Some(60.0));
        store.insert_listing(&bare).await.unwrap();
        store
            .insert_listing(&listing(Some("ACL_2P_CHATEAU_AZUR_3"), "fp-b", 700_000, Some(60.0)))
            .await
            .unwrap();

        let mut incoming = record("900", 700_000, Some(61.0));
        incoming.reference_raw = Some("ACL 2P CHATEAU AZUR 9".into());
        let matcher = Matcher::new(&store, Tolerances::default());
        let decision = matcher
            .resolve(&MatchInput::new(&incoming, website_id))
            .await
            .unwrap();

        let resolved = decision.resolved.unwrap();
        assert_eq!(resolved.listing.id, bare.id);
        assert_eq!(resolved.strategy, MatchStrategy::ReferenceCode);
    }

    #[tokio::test]
    async fn first_verified_prefix_candidate_wins() {
        let store = MemoryStore::new();
        let website_id = website(&store).await;
        let far = listing(Some("REF_AZUR_1"), "fp-1", 2_000_000, Some(200.0));
        let near = listing(Some("REF_AZUR_2"), "fp-2", 700_000, Some(60.0));
        let also_near = listing(Some("REF_AZUR_3"), "fp-3", 705_000, Some(61.0));
        for l in [&far, &near, &also_near] {
            store.insert_listing(l).await.unwrap();
        }

        let mut incoming = record("901", 702_000, Some(60.5));
        incoming.reference_raw = Some("REF AZUR 7".into());
        let decision = Matcher::new(&store, Tolerances::default())
            .resolve(&MatchInput::new(&incoming, website_id))
            .await
            .unwrap();
        assert_eq!(decision.resolved.unwrap().listing.id, near.id);
    }

    #[tokio::test]
    async fn lone_suffixed_candidate_is_taken_then_verified() {
        let store = MemoryStore::new();
        let website_id = website(&store).await;
        let only = listing(Some("ACL_2P_CHATEAU_AZUR_3"), "fp-b", 700_000, Some(60.0));
        store.insert_listing(&only).await.unwrap();
        let matcher = Matcher::new(&store, Tolerances::default());

        let mut close = record("904", 705_000, Some(62.0));
        close.reference_raw = Some("ACL 2P CHATEAU AZUR 9".into());
        let decision = matcher
            .resolve(&MatchInput::new(&close, website_id))
            .await
            .unwrap();
        let resolved = decision.resolved.unwrap();
        assert_eq!(resolved.listing.id, only.id);
        assert_eq!(resolved.strategy, MatchStrategy::ReferenceCode);

        let mut distant = record("905", 1_500_000, Some(120.0));
        distant.reference_raw = Some("ACL 2P CHATEAU AZUR 9".into());
        let decision = matcher
            .resolve(&MatchInput::new(&distant, website_id))
            .await
            .unwrap();
        assert!(decision.resolved.is_none());
        assert!(!decision.reference_code_usable);
        assert!(decision.fingerprint_usable);
    }

    #[tokio::test]
    async fn rejected_reference_candidate_clears_the_key() {
        let store = MemoryStore::new();
        let website_id = website(&store).await;
        store
            .insert_listing(&listing(Some("ABC123"), "fp-x", 500_000, Some(50.0)))
            .await
            .unwrap();

        let mut incoming = record("902", 900_000, Some(90.0));
        incoming.reference_raw = Some("abc123".into());
        let decision = Matcher::new(&store, Tolerances::default())
            .resolve(&MatchInput::new(&incoming, website_id))
            .await
            .unwrap();

        assert!(decision.resolved.is_none());
        assert!(!decision.reference_code_usable);
        assert!(decision.fingerprint_usable);
    }

    #[tokio::test]
    async fn fingerprint_candidate_needs_matching_rooms() {
        let store = MemoryStore::new();
        let website_id = website(&store).await;
        let incoming = record("903", 500_000, Some(50.0));
        let input = MatchInput::new(&incoming, website_id);
        store
            .insert_listing(&listing(None, &input.fingerprint, 500_000, Some(50.0)))
            .await
            .unwrap();

        let decision = Matcher::new(&store, Tolerances::default())
            .resolve(&input)
            .await
            .unwrap();
        assert!(decision.resolved.is_none());
        assert!(!decision.fingerprint_usable);
    }
}
