//! Desirability score (0-100) for Monaco rentals, recomputed on every listing write.
//!
//! Four independent subscores are summed: location (0-30), apartment quality
//! (0-30), building and amenities (0-25) and economics (0-15).

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::{InteriorCondition, Listing};

const LOCATION_TIERS: &[(f64, &[&str])] = &[
    (30.0, &["la rousse", "saint roman", "larvotto"]),
    (
        24.0,
        &["anse du portier", "monte carlo", "monte-carlo", "carre d'or"],
    ),
    (18.0, &["condamine", "moneghetti"]),
    (12.0, &["port", "fontvieille"]),
];

/// Jardin Exotique, Monaco Ville, other minor areas, and unknown districts.
const LOCATION_DEFAULT: f64 = 6.0;

const SIZE_TARGET_TWO_ROOMS_SQM: f64 = 75.0;
const SIZE_TARGET_DEFAULT_SQM: f64 = 90.0;

const PARKING_POINTS: f64 = 9.0;
const CONCIERGE_POINTS: f64 = 8.0;
const ELEVATOR_POINTS: f64 = 4.0;
const AC_POINTS: f64 = 4.0;

const RENT_TARGET_EUR: f64 = 9_000.0;
const RENT_CEILING_EUR: f64 = 11_000.0;
const RENT_BONUS_SPAN_EUR: f64 = 2_500.0;
const ECONOMICS_MAX: f64 = 15.0;
const ECONOMICS_RAW_MAX: f64 = 17.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub location: f64,
    pub size: f64,
    pub terrace: f64,
    pub interior: f64,
    pub apartment: f64,
    pub building: f64,
    pub economics: f64,
    pub total: i32,
}

/// Total score for a listing, clamped to `[0, 100]`.
pub fn score_listing(listing: &Listing) -> i32 {
    score_breakdown(listing).total
}

pub fn score_breakdown(listing: &Listing) -> ScoreBreakdown {
    let location = location_score(listing.district.as_deref());

    let livable = livable_area(listing);
    let size = size_score(listing.rooms, livable);
    let terrace = terrace_score(livable, listing.terrace_area_sqm);
    let interior = interior_condition_score(listing.interior_condition);
    let apartment = size + terrace + interior;

    let building = building_score(listing);
    let economics = economics_score(listing.price_monthly_cents);

    let total = (location + apartment + building + economics).round() as i32;

    ScoreBreakdown {
        location,
        size,
        terrace,
        interior,
        apartment,
        building,
        economics,
        total: total.clamp(0, 100),
    }
}

fn normalize_district(district: &str) -> String {
    district
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c == '\u{2019}' { '\'' } else { c })
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

fn is_combining_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&c)
}

pub(crate) fn location_score(district: Option<&str>) -> f64 {
    let Some(district) = district.filter(|d| !d.is_empty()) else {
        return LOCATION_DEFAULT;
    };
    let q = normalize_district(district);

    LOCATION_TIERS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| q.contains(needle)))
        .map(|(points, _)| *points)
        .unwrap_or(LOCATION_DEFAULT)
}

/// Living area if known; otherwise total area minus terrace, since some
/// sources include the terrace in the advertised total.
fn livable_area(listing: &Listing) -> Option<f64> {
    if listing.living_area_sqm.is_some() {
        return listing.living_area_sqm;
    }
    match (listing.total_area_sqm, listing.terrace_area_sqm) {
        (Some(total), Some(terrace)) if total != 0.0 && terrace != 0.0 => {
            Some((total - terrace).max(0.0))
        }
        (total, _) => total,
    }
}

pub(crate) fn size_score(rooms: Option<i32>, livable_sqm: Option<f64>) -> f64 {
    let target = if rooms == Some(2) {
        SIZE_TARGET_TWO_ROOMS_SQM
    } else {
        SIZE_TARGET_DEFAULT_SQM
    };
    let area = livable_sqm.unwrap_or(0.0);

    if area <= 0.0 || area <= 0.8 * target {
        0.0
    } else if area <= target {
        6.0
    } else if area <= target + 15.0 {
        10.0
    } else {
        15.0
    }
}

pub(crate) fn terrace_score(livable_sqm: Option<f64>, terrace_sqm: Option<f64>) -> f64 {
    let area = livable_sqm.unwrap_or(0.0);
    let terrace = terrace_sqm.unwrap_or(0.0);
    if terrace <= 0.0 {
        return 0.0;
    }

    let ratio = if area > 0.0 { terrace / area } else { 0.0 };
    if ratio < 0.08 && terrace < 8.0 {
        2.0
    } else if ratio < 0.20 && terrace < 20.0 {
        4.0
    } else {
        7.0
    }
}

pub(crate) fn interior_condition_score(condition: Option<InteriorCondition>) -> f64 {
    match condition {
        Some(InteriorCondition::LuxuryRenovated) => 8.0,
        Some(InteriorCondition::GoodModern) => 6.0,
        Some(InteriorCondition::DatedOk) | None => 4.0,
        Some(InteriorCondition::VeryDated) => 2.0,
        Some(InteriorCondition::Poor) => 0.0,
    }
}

fn building_score(listing: &Listing) -> f64 {
    let mut points = 0.0;
    if listing.parking_spaces.is_some_and(|spaces| spaces > 0) {
        points += PARKING_POINTS;
    }
    if listing.has_concierge == Some(true) {
        points += CONCIERGE_POINTS;
    }
    if listing.has_elevator == Some(true) {
        points += ELEVATOR_POINTS;
    }
    if listing.has_ac == Some(true) {
        points += AC_POINTS;
    }
    points.min(25.0)
}

pub(crate) fn economics_score(price_monthly_cents: i64) -> f64 {
    let rent = price_monthly_cents as f64 / 100.0;
    if rent <= 0.0 {
        return 0.0;
    }

    let base = if rent <= RENT_TARGET_EUR {
        15.0
    } else if rent >= RENT_CEILING_EUR {
        5.0
    } else {
        15.0 - 10.0 * (rent - RENT_TARGET_EUR) / (RENT_CEILING_EUR - RENT_TARGET_EUR)
    };

    let bonus = if rent < RENT_TARGET_EUR {
        ((RENT_TARGET_EUR - rent) / RENT_BONUS_SPAN_EUR).min(2.0)
    } else {
        0.0
    };

    ((base + bonus) * ECONOMICS_MAX / ECONOMICS_RAW_MAX)
        .round()
        .clamp(0.0, ECONOMICS_MAX)
}
