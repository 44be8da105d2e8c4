use chrono::{DateTime, Utc};
use rentwatch_core::{score_listing, Condition, Listing, ParsedListing, DEFAULT_CURRENCY};
use uuid::Uuid;

/// Keys a newly created listing is allowed to claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingKeys {
    pub fingerprint: String,
    pub reference_code_normalized: Option<String>,
}

/// Build a fresh canonical listing from a record that matched nothing.
pub fn new_listing(record: &ParsedListing, keys: ListingKeys, now: DateTime<Utc>) -> Listing {
    let mut listing = Listing {
        id: Uuid::new_v4(),
        fingerprint: keys.fingerprint,
        reference_code: record.reference_raw.clone().filter(|r| !r.is_empty()),
        reference_code_normalized: keys.reference_code_normalized,
        title: record.title.clone(),
        city: record.city.clone(),
        district: non_empty(&record.district),
        building_name: non_empty(&record.building_name),
        address: non_empty(&record.address),
        contract_type: record.contract_type,
        property_type: record.property_type,
        price_monthly_cents: record.price_monthly_cents,
        currency: record
            .currency
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        service_charges_monthly_cents: record.service_charges_monthly_cents,
        service_charges_included: record.service_charges_included,
        rooms: record.rooms,
        bedrooms: record.bedrooms,
        bathrooms: record.bathrooms,
        total_area_sqm: record.total_area_sqm,
        living_area_sqm: record.living_area_sqm,
        terrace_area_sqm: record.terrace_area_sqm,
        floor: record.floor,
        parking_spaces: record.parking_spaces,
        cellars: record.cellars,
        is_mixed_use: record.is_mixed_use,
        has_rooftop: record.has_rooftop,
        has_terrace: record.has_terrace,
        has_sea_view: record.has_sea_view,
        has_elevator: record.has_elevator,
        has_concierge: record.has_concierge,
        has_ac: record.has_ac,
        condition: record.condition.unwrap_or(Condition::Unknown),
        interior_condition: record.interior_condition,
        features_tags: record.features_tags.clone(),
        description: non_empty(&record.description),
        description_lang: non_empty(&record.description_lang),
        agency_name: non_empty(&record.agency_name),
        agency_address: non_empty(&record.agency_address),
        agency_phone: non_empty(&record.agency_phone),
        agency_email: non_empty(&record.agency_email),
        agency_website: non_empty(&record.agency_website),
        primary_url: Some(record.url.clone()),
        all_urls: union_preserving_order(&[], std::slice::from_ref(&record.url)),
        image_urls: union_preserving_order(&[], &record.image_urls),
        score: None,
        first_seen_at: now,
        last_seen_at: now,
        is_active: true,
    };
    listing.score = Some(score_listing(&listing));
    listing
}

/// Fold an incoming record into an existing listing.
///
/// Known values are only ever replaced by known values. Identity keys, the
/// classification fields and `first_seen_at` are left as they were.
pub fn merge_listing(existing: &Listing, record: &ParsedListing, now: DateTime<Utc>) -> Listing {
    let mut merged = existing.clone();

    if !record.title.is_empty() {
        merged.title = record.title.clone();
    }
    overwrite_text(&mut merged.district, &record.district);
    overwrite_text(&mut merged.building_name, &record.building_name);
    overwrite_text(&mut merged.address, &record.address);

    merged.price_monthly_cents = record.price_monthly_cents;
    overwrite(
        &mut merged.service_charges_monthly_cents,
        &record.service_charges_monthly_cents,
    );
    overwrite(&mut merged.service_charges_included, &record.service_charges_included);

    overwrite(&mut merged.rooms, &record.rooms);
    overwrite(&mut merged.bedrooms, &record.bedrooms);
    overwrite(&mut merged.bathrooms, &record.bathrooms);
    overwrite(&mut merged.total_area_sqm, &record.total_area_sqm);
    overwrite(&mut merged.living_area_sqm, &record.living_area_sqm);
    overwrite(&mut merged.terrace_area_sqm, &record.terrace_area_sqm);
    overwrite(&mut merged.floor, &record.floor);

    overwrite(&mut merged.parking_spaces, &record.parking_spaces);
    overwrite(&mut merged.cellars, &record.cellars);
    overwrite(&mut merged.is_mixed_use, &record.is_mixed_use);

    overwrite(&mut merged.has_rooftop, &record.has_rooftop);
    overwrite(&mut merged.has_terrace, &record.has_terrace);
    overwrite(&mut merged.has_sea_view, &record.has_sea_view);
    overwrite(&mut merged.has_elevator, &record.has_elevator);
    overwrite(&mut merged.has_concierge, &record.has_concierge);
    overwrite(&mut merged.has_ac, &record.has_ac);
    if let Some(condition) = record.condition {
        merged.condition = condition;
    }
    overwrite(&mut merged.interior_condition, &record.interior_condition);
    if !record.features_tags.is_empty() {
        merged.features_tags = record.features_tags.clone();
    }

    overwrite_text(&mut merged.description, &record.description);
    overwrite_text(&mut merged.description_lang, &record.description_lang);

    overwrite_text(&mut merged.agency_name, &record.agency_name);
    overwrite_text(&mut merged.agency_address, &record.agency_address);
    overwrite_text(&mut merged.agency_phone, &record.agency_phone);
    overwrite_text(&mut merged.agency_email, &record.agency_email);
    overwrite_text(&mut merged.agency_website, &record.agency_website);

    if merged.primary_url.as_deref().map_or(true, str::is_empty) {
        merged.primary_url = Some(record.url.clone());
    }
    merged.all_urls = union_preserving_order(&existing.all_urls, std::slice::from_ref(&record.url));
    merged.image_urls = union_preserving_order(&existing.image_urls, &record.image_urls);

    merged.last_seen_at = now;
    merged.is_active = true;
    merged.score = Some(score_listing(&merged));
    merged
}

fn overwrite<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value.clone());
    }
}

/// Like `overwrite`, with an empty string counting as absent.
fn overwrite_text(target: &mut Option<String>, incoming: &Option<String>) {
    overwrite(target, &non_empty(incoming));
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

/// Set union keeping first-seen order.
pub fn union_preserving_order(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for url in existing.iter().chain(incoming) {
        if !out.contains(url) {
            out.push(url.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rentwatch_core::InteriorCondition;

    fn record() -> ParsedListing {
        serde_json::from_value(serde_json::json!({
            "sourceWebsiteCode": "CIM",
            "sourceListingId": "99966",
            "url": "https://cim.example/property/99966",
            "title": "Villa Antoinette duplex",
            "city": "Monaco",
            "contractType": "RENT",
            "propertyType": "APARTMENT",
            "priceMonthlyCents": 990000,
            "rooms": 3,
            "totalAreaSqm": 110.0,
            "district": "La Rousse - Saint Roman",
            "imageUrls": ["https://img.example/1.jpg", "https://img.example/2.jpg"]
        }))
        .unwrap()
    }

    fn keys() -> ListingKeys {
        ListingKeys {
            fingerprint: "fp".into(),
            reference_code_normalized: None,
        }
    }

    #[test]
    fn new_listing_defaults() {
        let now = Utc::now();
        let listing = new_listing(&record(), keys(), now);
        assert_eq!(listing.condition, Condition::Unknown);
        assert_eq!(listing.currency, "EUR");
        assert_eq!(listing.primary_url.as_deref(), Some("https://cim.example/property/99966"));
        assert_eq!(listing.all_urls.len(), 1);
        assert_eq!(listing.first_seen_at, listing.last_seen_at);
        assert!(listing.is_active);
        assert!(listing.score.is_some());
    }

    #[test]
    fn absent_values_never_erase_known_ones() {
        let created = Utc::now() - Duration::days(3);
        let mut existing = new_listing(&record(), keys(), created);
        existing.bathrooms = Some(2);
        existing.agency_name = Some("Agence Riviera".into());
        existing.interior_condition = Some(InteriorCondition::GoodModern);

        let mut incoming = record();
        incoming.rooms = None;
        incoming.district = None;
        incoming.title = String::new();
        incoming.price_monthly_cents = 950_000;
        incoming.bathrooms = Some(3);

        let now = Utc::now();
        let merged = merge_listing(&existing, &incoming, now);
        assert_eq!(merged.rooms, Some(3));
        assert_eq!(merged.district.as_deref(), Some("La Rousse - Saint Roman"));
        assert_eq!(merged.title, "Villa Antoinette duplex");
        assert_eq!(merged.agency_name.as_deref(), Some("Agence Riviera"));
        assert_eq!(merged.interior_condition, Some(InteriorCondition::GoodModern));
        assert_eq!(merged.bathrooms, Some(3));
        assert_eq!(merged.price_monthly_cents, 950_000);
        assert_eq!(merged.first_seen_at, created);
        assert_eq!(merged.last_seen_at, now);
        assert_eq!(merged.fingerprint, existing.fingerprint);
    }

    #[test]
    fn empty_strings_never_erase_known_text() {
        let mut first = record();
        first.district = Some("Larvotto".into());
        first.agency_name = Some("Agence Riviera".into());
        let existing = new_listing(&first, keys(), Utc::now());

        let mut incoming = record();
        incoming.district = Some(String::new());
        incoming.building_name = Some(String::new());
        incoming.agency_name = Some(String::new());
        incoming.description = Some("Vue mer".into());

        let merged = merge_listing(&existing, &incoming, Utc::now());
        assert_eq!(merged.district.as_deref(), Some("Larvotto"));
        assert_eq!(merged.building_name, None);
        assert_eq!(merged.agency_name.as_deref(), Some("Agence Riviera"));
        assert_eq!(merged.description.as_deref(), Some("Vue mer"));
        assert_eq!(merged.score, existing.score);
    }

    #[test]
    fn whitespace_title_still_overwrites() {
        let existing = new_listing(&record(), keys(), Utc::now());
        let mut incoming = record();
        incoming.title = " ".into();
        let merged = merge_listing(&existing, &incoming, Utc::now());
        assert_eq!(merged.title, " ");
    }

    #[test]
    fn url_and_image_sets_are_unioned_in_order() {
        let existing = new_listing(&record(), keys(), Utc::now());
        let mut incoming = record();
        incoming.url = "https://mcre.example/villa-antoinette".into();
        incoming.image_urls = vec![
            "https://img.example/2.jpg".into(),
            "https://img.example/3.jpg".into(),
        ];

        let merged = merge_listing(&existing, &incoming, Utc::now());
        assert_eq!(
            merged.all_urls,
            vec![
                "https://cim.example/property/99966".to_string(),
                "https://mcre.example/villa-antoinette".to_string(),
            ]
        );
        assert_eq!(merged.image_urls.len(), 3);
        assert_eq!(merged.image_urls[2], "https://img.example/3.jpg");
        assert_eq!(
            merged.primary_url.as_deref(),
            Some("https://cim.example/property/99966")
        );
    }

    #[test]
    fn empty_feature_tags_keep_existing_tags() {
        let mut existing = new_listing(&record(), keys(), Utc::now());
        existing.features_tags = vec!["sea_view".into()];
        let merged = merge_listing(&existing, &record(), Utc::now());
        assert_eq!(merged.features_tags, vec!["sea_view".to_string()]);
    }
}
