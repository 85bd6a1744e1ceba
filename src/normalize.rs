//! Search input canonicalization.
//!
//! Turns raw user input into a typed [`ParcelKey`]. Pure and deterministic.
//!
//! # Rules
//!
//! - **APN**: separators are stripped and letters uppercased. The cleaned
//!   value must be 8–10 digits with an optional single trailing letter
//!   (book-map-parcel, split suffix, extended form).
//! - **Address / owner**: trimmed, inner whitespace collapsed, uppercased.
//!   Only non-emptiness is checked.
//! - **Auto-detection** (no hint): APN shape first, then any street-type
//!   token makes it an address, everything else is an owner name.

use crate::error::CollectError;
use crate::models::{KeyKind, ParcelKey};

const APN_MIN_DIGITS: usize = 8;
const APN_MAX_DIGITS: usize = 10;

const STREET_TYPES: &[&str] = &[
    "ST", "STREET", "AVE", "AV", "AVENUE", "RD", "ROAD", "DR", "DRIVE", "LN", "LANE", "BLVD",
    "BOULEVARD", "WAY", "CT", "COURT", "PL", "PLACE", "CIR", "CIRCLE", "PKWY", "PARKWAY", "HWY",
    "HIGHWAY", "TRL", "TRAIL", "TER", "TERRACE", "LOOP",
];

/// Canonicalizes `raw` into a [`ParcelKey`].
///
/// With a `hint` the input is validated as that kind only. Without one the
/// kind is detected; ambiguous inputs become owner names.
pub fn normalize(raw: &str, hint: Option<KeyKind>) -> Result<ParcelKey, CollectError> {
    match hint {
        Some(KeyKind::Apn) => normalize_apn(raw)
            .map(|apn| ParcelKey::from_parts(KeyKind::Apn, apn, raw))
            .ok_or_else(|| CollectError::invalid(raw, "not a recognized APN format")),
        Some(kind) => {
            let text = normalize_text(raw);
            if text.is_empty() {
                return Err(CollectError::invalid(raw, format!("{} must not be empty", kind)));
            }
            Ok(ParcelKey::from_parts(kind, text, raw))
        }
        None => {
            if let Some(apn) = normalize_apn(raw) {
                return Ok(ParcelKey::from_parts(KeyKind::Apn, apn, raw));
            }
            let text = normalize_text(raw);
            if text.is_empty() {
                return Err(CollectError::invalid(raw, "input must not be empty"));
            }
            let kind = if looks_like_address(&text) {
                KeyKind::Address
            } else {
                KeyKind::OwnerName
            };
            Ok(ParcelKey::from_parts(kind, text, raw))
        }
    }
}

/// Returns the cleaned APN if `raw` has a recognized APN shape.
fn normalize_apn(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Only separators may be dropped; anything else means this is not an APN.
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '.' | '/' | '_'))
    {
        return None;
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    // Optional single-letter suffix after the numeric body.
    let digits = match cleaned.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => &cleaned[..idx],
        _ => cleaned.as_str(),
    };
    let digits_ok = (APN_MIN_DIGITS..=APN_MAX_DIGITS).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit());
    digits_ok.then_some(cleaned)
}

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn looks_like_address(text: &str) -> bool {
    text.split(' ')
        .map(|token| token.trim_end_matches(['.', ',']))
        .any(|token| STREET_TYPES.contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apn_with_spaces() {
        let key = normalize("501 38 237", None).unwrap();
        assert_eq!(key.kind(), KeyKind::Apn);
        assert_eq!(key.normalized_value(), "50138237");
        assert_eq!(key.raw_value(), "501 38 237");
    }

    #[test]
    fn apn_separator_variants_are_one_target() {
        let a = normalize("501-38-237", None).unwrap();
        let b = normalize("50138237", None).unwrap();
        let c = normalize(" 501.38.237 ", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn apn_with_letter_suffix() {
        let key = normalize("133-04-014a", None).unwrap();
        assert_eq!(key.kind(), KeyKind::Apn);
        assert_eq!(key.normalized_value(), "13304014A");
    }

    #[test]
    fn extended_apn() {
        let key = normalize("1234567890", None).unwrap();
        assert_eq!(key.kind(), KeyKind::Apn);
    }

    #[test]
    fn hinted_apn_rejects_bad_shape() {
        let err = normalize("12-34", Some(KeyKind::Apn)).unwrap_err();
        assert!(matches!(err, CollectError::InvalidFormat { .. }));
        let err = normalize("12345678AB", Some(KeyKind::Apn)).unwrap_err();
        assert!(matches!(err, CollectError::InvalidFormat { .. }));
    }

    #[test]
    fn address_detection() {
        let key = normalize("  5850 w  glendale ave ", None).unwrap();
        assert_eq!(key.kind(), KeyKind::Address);
        assert_eq!(key.normalized_value(), "5850 W GLENDALE AVE");
    }

    #[test]
    fn ambiguous_input_is_owner_name() {
        let key = normalize("city of   glendale", None).unwrap();
        assert_eq!(key.kind(), KeyKind::OwnerName);
        assert_eq!(key.normalized_value(), "CITY OF GLENDALE");
    }

    #[test]
    fn hint_overrides_detection() {
        let key = normalize("Main St Holdings LLC", Some(KeyKind::OwnerName)).unwrap();
        assert_eq!(key.kind(), KeyKind::OwnerName);
    }

    #[test]
    fn empty_input_is_invalid() {
        assert!(normalize("   ", None).is_err());
        assert!(normalize("", Some(KeyKind::Address)).is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in [
            "501 38 237",
            "13304014A",
            "5850 W Glendale Ave",
            "city of glendale",
            "  Smith,   John ",
        ] {
            let key = normalize(input, None).unwrap();
            assert_eq!(normalize(key.raw_value(), None).unwrap(), key);
            assert_eq!(
                normalize(key.normalized_value(), Some(key.kind())).unwrap(),
                key,
                "canonical form must be stable for {:?}",
                input
            );
        }
    }
}
