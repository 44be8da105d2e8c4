//! Canonical comparison keys: normalized reference codes and content fingerprints.

use unicode_normalization::UnicodeNormalization;

/// Price bucket width used by [`build_fingerprint`], in minor currency units.
pub const FINGERPRINT_PRICE_BUCKET_CENTS: i64 = 500;

/// Normalize a scraped reference code so different sites compare equal.
///
/// `"rif ACL_2P_Chateau_Azur_"` and `"ACL 2P  Chateau_Azur"` both become
/// `"ACL_2P_CHATEAU_AZUR"`. Returns `None` for missing or blank input.
pub fn normalize_reference(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    let upper = raw.to_uppercase();
    let body = strip_rif_token(&upper);

    let mut out = String::with_capacity(body.len());
    let mut in_separator = false;
    for c in body.chars() {
        if c.is_whitespace() || c == '_' {
            if !in_separator {
                out.push('_');
                in_separator = true;
            }
        } else {
            out.push(c);
            in_separator = false;
        }
    }

    let out = out.trim_end_matches('_').trim();
    if out.is_empty() {
        None
    } else {
        Some(out.to_string())
    }
}

fn strip_rif_token(upper: &str) -> &str {
    match upper.strip_prefix("RIF") {
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => upper,
    }
}

/// Base prefix of a normalized reference code with its trailing `_<digits>`
/// counter removed, e.g. `ACL_2P_CHATEAU_AZUR_9` -> `ACL_2P_CHATEAU_AZUR`.
///
/// Returns `None` when there is nothing to strip or nothing left.
pub fn reference_base_prefix(normalized: &str) -> Option<String> {
    let without_counter = match normalized.rsplit_once('_') {
        Some((head, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => head,
        _ => normalized,
    };
    let base = without_counter.trim_end_matches('_');
    if base.is_empty() || base == normalized {
        None
    } else {
        Some(base.to_string())
    }
}

/// Descriptive attributes that feed the content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintInput<'a> {
    pub city: &'a str,
    pub district: Option<&'a str>,
    pub building_name: Option<&'a str>,
    pub living_area_sqm: Option<f64>,
    pub terrace_area_sqm: Option<f64>,
    pub bedrooms: Option<i32>,
    pub rooms: Option<i32>,
    pub price_monthly_cents: i64,
}

/// Deterministic content key used when no reliable reference code exists.
///
/// Text segments that normalize to nothing are left out of the key; numeric
/// segments always appear, with `0` standing in for unknown values.
pub fn build_fingerprint(input: &FingerprintInput<'_>) -> String {
    let segments = [
        clean_segment(Some(input.city)),
        clean_segment(input.district),
        clean_segment(input.building_name),
        format!("liv:{}", input.living_area_sqm.unwrap_or(0.0)),
        format!("terr:{}", input.terrace_area_sqm.unwrap_or(0.0)),
        format!("bed:{}", input.bedrooms.unwrap_or(0)),
        format!("rooms:{}", input.rooms.unwrap_or(0)),
        format!("p:{}", round_price_bucket(input.price_monthly_cents)),
    ];

    segments
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("|")
}

/// Fingerprint used for a new listing whose natural fingerprint already
/// belongs to a different unit.
pub fn disambiguated_fingerprint(fingerprint: &str, source_listing_id: &str) -> String {
    format!("{fingerprint}|url:{source_listing_id}")
}

/// Round to the nearest bucket, halves rounding up.
pub fn round_price_bucket(price_cents: i64) -> i64 {
    let half = FINGERPRINT_PRICE_BUCKET_CENTS / 2;
    price_cents
        .saturating_add(half)
        .div_euclid(FINGERPRINT_PRICE_BUCKET_CENTS)
        * FINGERPRINT_PRICE_BUCKET_CENTS
}

fn clean_segment(value: Option<&str>) -> String {
    let lowered = value.unwrap_or_default().to_lowercase();
    let folded = lowered
        .nfkd()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>();

    let mut out = String::with_capacity(folded.len());
    let mut in_space = false;
    for c in folded.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('-');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn villa(price_monthly_cents: i64) -> FingerprintInput<'static> {
        FingerprintInput {
            city: "Monaco",
            district: Some("La Rousse - Saint Roman"),
            building_name: Some("Villa Antoinette"),
            living_area_sqm: Some(110.0),
            terrace_area_sqm: Some(110.0),
            bedrooms: Some(2),
            rooms: Some(3),
            price_monthly_cents,
        }
    }

    #[test]
    fn reference_normalization_handles_site_variants() {
        assert_eq!(
            normalize_reference(Some("rif ACL_2P_Chateau_Azur_")).as_deref(),
            Some("ACL_2P_CHATEAU_AZUR")
        );
        assert_eq!(
            normalize_reference(Some("RIF WL VILLA ANTOINETTE")).as_deref(),
            Some("WL_VILLA_ANTOINETTE")
        );
        assert_eq!(
            normalize_reference(Some("acl  2p __ chateau_azur_9")).as_deref(),
            Some("ACL_2P_CHATEAU_AZUR_9")
        );
        assert_eq!(normalize_reference(Some("RIFLESSO 12")).as_deref(), Some("RIFLESSO_12"));
    }

    #[test]
    fn reference_normalization_rejects_blank_input() {
        assert_eq!(normalize_reference(None), None);
        assert_eq!(normalize_reference(Some("")), None);
        assert_eq!(normalize_reference(Some("___")), None);
    }

    #[test]
    fn reference_normalization_is_idempotent() {
        for raw in ["rif ACL_2P_Chateau_Azur_", "Park Palace 7", "x_y__z", "RIF  RIF  A"] {
            let once = normalize_reference(Some(raw)).unwrap();
            let twice = normalize_reference(Some(&once)).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn base_prefix_strips_trailing_counter_only() {
        assert_eq!(
            reference_base_prefix("ACL_2P_CHATEAU_AZUR_9").as_deref(),
            Some("ACL_2P_CHATEAU_AZUR")
        );
        assert_eq!(reference_base_prefix("ACL_2P_CHATEAU_AZUR"), None);
        assert_eq!(reference_base_prefix("12345"), None);
        assert_eq!(reference_base_prefix("_12"), None);
    }

    #[test]
    fn fingerprint_layout_is_stable() {
        assert_eq!(
            build_fingerprint(&villa(990_000)),
            "monaco|la-rousse-saint-roman|villa-antoinette|liv:110|terr:110|bed:2|rooms:3|p:990000"
        );
    }

    #[test]
    fn fingerprint_strips_diacritics_and_skips_empty_text() {
        let input = FingerprintInput {
            city: "Monaco",
            district: None,
            building_name: Some("Le Château Périgord"),
            living_area_sqm: Some(72.5),
            terrace_area_sqm: None,
            bedrooms: None,
            rooms: Some(2),
            price_monthly_cents: 480_000,
        };
        assert_eq!(
            build_fingerprint(&input),
            "monaco|le-chateau-perigord|liv:72.5|terr:0|bed:0|rooms:2|p:480000"
        );
    }

    #[test]
    fn fingerprint_absorbs_price_noise_within_bucket() {
        assert_eq!(build_fingerprint(&villa(900_000)), build_fingerprint(&villa(900_200)));
        assert_ne!(build_fingerprint(&villa(900_000)), build_fingerprint(&villa(900_600)));
    }

    #[test]
    fn price_bucket_rounds_halves_up() {
        assert_eq!(round_price_bucket(0), 0);
        assert_eq!(round_price_bucket(249), 0);
        assert_eq!(round_price_bucket(250), 500);
        assert_eq!(round_price_bucket(900_749), 900_500);
        assert_eq!(round_price_bucket(900_750), 901_000);
    }

    #[test]
    fn bucket_rounding_saturates_at_the_top_of_the_range() {
        let top = round_price_bucket(i64::MAX);
        assert!(top > i64::MAX - 500);
        assert_eq!(top % 500, 0);
    }

    #[test]
    fn disambiguated_fingerprint_appends_source_id() {
        assert_eq!(disambiguated_fingerprint("monaco|p:0", "4411"), "monaco|p:0|url:4411");
    }
}
