//! Core domain model for rentwatch: canonical listings, provenance records and
//! the parsed handoff contract coming out of the per-site scrapers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;
pub mod scoring;

pub use normalize::{
    build_fingerprint, disambiguated_fingerprint, normalize_reference, reference_base_prefix,
    FingerprintInput,
};
pub use scoring::{score_breakdown, score_listing, ScoreBreakdown};

pub const CRATE_NAME: &str = "rentwatch-core";

pub const DEFAULT_CURRENCY: &str = "EUR";

/// Error returned when a stored enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! labelled_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

labelled_enum!(ContractType, "contract type", {
    Rent => "RENT",
    Sale => "SALE",
});

labelled_enum!(PropertyType, "property type", {
    Apartment => "APARTMENT",
    PenthouseApartment => "PENTHOUSE_APARTMENT",
    Studio => "STUDIO",
    Villa => "VILLA",
    Office => "OFFICE",
    Other => "OTHER",
});

labelled_enum!(Condition, "condition", {
    New => "NEW",
    Renovated => "RENOVATED",
    Good => "GOOD",
    ToRefresh => "TO_REFRESH",
    ToRenovate => "TO_RENOVATE",
    Unknown => "UNKNOWN",
});

labelled_enum!(InteriorCondition, "interior condition", {
    LuxuryRenovated => "LUXURY_RENOVATED",
    GoodModern => "GOOD_MODERN",
    DatedOk => "DATED_OK",
    VeryDated => "VERY_DATED",
    Poor => "POOR",
});

/// A known origin site. Seeded once, read-only to the upsert engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceWebsite {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub base_url: String,
}

/// Parsed handoff contract from the scrapers into the upsert engine.
///
/// `title`, `city`, `contract_type`, `property_type` and `price_monthly_cents`
/// are required by contract; everything else is optional and never erases a
/// known value when merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedListing {
    pub source_website_code: String,
    pub source_listing_id: String,
    pub url: String,
    #[serde(default)]
    pub reference_raw: Option<String>,

    pub title: String,
    pub city: String,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,

    pub contract_type: ContractType,
    pub property_type: PropertyType,

    pub price_monthly_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub service_charges_monthly_cents: Option<i64>,
    #[serde(default)]
    pub service_charges_included: Option<bool>,

    #[serde(default)]
    pub rooms: Option<i32>,
    #[serde(default)]
    pub bedrooms: Option<i32>,
    #[serde(default)]
    pub bathrooms: Option<i32>,
    #[serde(default)]
    pub total_area_sqm: Option<f64>,
    #[serde(default)]
    pub living_area_sqm: Option<f64>,
    #[serde(default)]
    pub terrace_area_sqm: Option<f64>,
    #[serde(default)]
    pub floor: Option<i32>,

    #[serde(default)]
    pub parking_spaces: Option<i32>,
    #[serde(default)]
    pub cellars: Option<i32>,
    #[serde(default)]
    pub is_mixed_use: Option<bool>,

    #[serde(default)]
    pub has_rooftop: Option<bool>,
    #[serde(default)]
    pub has_terrace: Option<bool>,
    #[serde(default)]
    pub has_sea_view: Option<bool>,
    #[serde(default)]
    pub has_elevator: Option<bool>,
    #[serde(default)]
    pub has_concierge: Option<bool>,
    #[serde(default)]
    pub has_ac: Option<bool>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub interior_condition: Option<InteriorCondition>,

    #[serde(default)]
    pub features_tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_lang: Option<String>,

    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(default)]
    pub agency_address: Option<String>,
    #[serde(default)]
    pub agency_phone: Option<String>,
    #[serde(default)]
    pub agency_email: Option<String>,
    #[serde(default)]
    pub agency_website: Option<String>,

    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub raw_payload: Option<serde_json::Value>,
}

impl ParsedListing {
    /// Fingerprint input view over this record's descriptive attributes.
    pub fn fingerprint_input(&self) -> FingerprintInput<'_> {
        FingerprintInput {
            city: &self.city,
            district: self.district.as_deref(),
            building_name: self.building_name.as_deref(),
            living_area_sqm: self.living_area_sqm,
            terrace_area_sqm: self.terrace_area_sqm,
            bedrooms: self.bedrooms,
            rooms: self.rooms,
            price_monthly_cents: self.price_monthly_cents,
        }
    }
}

/// Canonical record-of-truth for one physical rental unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub fingerprint: String,
    pub reference_code: Option<String>,
    pub reference_code_normalized: Option<String>,

    pub title: String,
    pub city: String,
    pub district: Option<String>,
    pub building_name: Option<String>,
    pub address: Option<String>,

    pub contract_type: ContractType,
    pub property_type: PropertyType,

    pub price_monthly_cents: i64,
    pub currency: String,
    pub service_charges_monthly_cents: Option<i64>,
    pub service_charges_included: Option<bool>,

    pub rooms: Option<i32>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub total_area_sqm: Option<f64>,
    pub living_area_sqm: Option<f64>,
    pub terrace_area_sqm: Option<f64>,
    pub floor: Option<i32>,

    pub parking_spaces: Option<i32>,
    pub cellars: Option<i32>,
    pub is_mixed_use: Option<bool>,

    pub has_rooftop: Option<bool>,
    pub has_terrace: Option<bool>,
    pub has_sea_view: Option<bool>,
    pub has_elevator: Option<bool>,
    pub has_concierge: Option<bool>,
    pub has_ac: Option<bool>,
    pub condition: Condition,
    pub interior_condition: Option<InteriorCondition>,
    pub features_tags: Vec<String>,

    pub description: Option<String>,
    pub description_lang: Option<String>,

    pub agency_name: Option<String>,
    pub agency_address: Option<String>,
    pub agency_phone: Option<String>,
    pub agency_email: Option<String>,
    pub agency_website: Option<String>,

    pub primary_url: Option<String>,
    pub all_urls: Vec<String>,
    pub image_urls: Vec<String>,

    pub score: Option<i32>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Listing {
    /// Total area minus terrace, used when sources disagree on whether the
    /// terrace is included in the advertised surface.
    pub fn livable_area_by_total(&self) -> Option<f64> {
        self.total_area_sqm
            .map(|total| total - self.terrace_area_sqm.unwrap_or(0.0))
    }
}

/// One source website's observation of a canonical listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSource {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub source_website_id: Uuid,
    pub source_listing_id: String,
    pub url: String,
    pub source_reference_code: Option<String>,
    pub source_reference_code_normalized: Option<String>,
    pub source_title: Option<String>,
    pub raw_payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active_on_source: bool,
}

impl ListingSource {
    pub fn is_observation_of(&self, source_website_id: Uuid, source_listing_id: &str) -> bool {
        self.source_website_id == source_website_id && self.source_listing_id == source_listing_id
    }
}

labelled_enum!(MatchStrategy, "match strategy", {
    SourceIdentity => "SOURCE_IDENTITY",
    ReferenceCode => "REFERENCE_CODE",
    Fingerprint => "FINGERPRINT",
    Structural => "STRUCTURAL",
    FingerprintConflict => "FINGERPRINT_CONFLICT",
});

/// Per-record result handed back to the caller, which uses it to decide on
/// new-listing notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub listing_id: Uuid,
    pub listing_source_id: Uuid,
    pub created_new_listing: bool,
    pub score: Option<i32>,
    pub price_monthly_cents: i64,
    /// How the record was resolved; `None` when a new listing was created.
    pub matched_by: Option<MatchStrategy>,
}
