//! The Basic Storage Object (BSO) value object and its field validation.
//!
//! Mirrors the shape of [`params::PostCollectionBso`] but is the single
//! place that knows the wire-level field constraints, so the batch
//! pipeline and any future single-item PUT path can validate a raw,
//! untyped JSON-derived record the same way and continue processing
//! sibling items on a per-item failure rather than aborting the whole
//! request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Printable ASCII, 1-64 chars: `0x20..=0x7e`.
const ID_MIN_LEN: usize = 1;
const ID_MAX_LEN: usize = 64;
/// 256 KiB, measured in UTF-8 bytes.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;
const SORTINDEX_MIN: i64 = -999_999_999;
const SORTINDEX_MAX: i64 = 999_999_999;
/// One year, in seconds.
const TTL_MAX: u64 = 31_536_000;

/// An incoming BSO as deserialized from a request body, before field
/// validation. All fields but `id` are optional: a PUT/POST may touch
/// only some of a record's fields, leaving the rest untouched server-side.
///
/// `sortindex`/`ttl` are held as a bare [`Value`] rather than a typed
/// `Option<i64>`: a batch item with a wrong-typed field (e.g. a string
/// `sortindex`) still needs to deserialize so [`validate`] can turn the
/// mismatch into a per-id `failed` reason rather than letting
/// `serde_json` reject the whole batch's top-level `Vec<BsoBody>`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BsoBody {
    pub id: Option<String>,
    #[serde(default)]
    pub sortindex: Option<Value>,
    pub payload: Option<String>,
    #[serde(default)]
    pub ttl: Option<Value>,
}

/// A validated BSO, ready to hand to the Durable Store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidBso {
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    pub ttl: Option<u32>,
}

/// Why a [`BsoBody`] failed [`validate`]. Display text is the "reason"
/// string that ends up in a batch pipeline's per-id `failed` map.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BsoValidationError {
    #[error("invalid id")]
    InvalidId,
    #[error("invalid sortindex")]
    InvalidSortindex,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("invalid ttl")]
    InvalidTtl,
}

/// Validate a raw id string against the wire format independent of a
/// full [`BsoBody`] (used by single-item routes keyed off a URL segment).
pub fn validate_id(id: &str) -> bool {
    let len = id.len();
    (ID_MIN_LEN..=ID_MAX_LEN).contains(&len) && id.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Validate and convert a [`BsoBody`] into a [`ValidBso`]. Returns the
/// first constraint violated; callers that need to report every
/// violation can call the individual `validate_*` helpers directly.
pub fn validate(id: &str, body: &BsoBody) -> Result<ValidBso, BsoValidationError> {
    if !validate_id(id) {
        return Err(BsoValidationError::InvalidId);
    }
    let sortindex = match &body.sortindex {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if (SORTINDEX_MIN..=SORTINDEX_MAX).contains(&v) => Some(v as i32),
            _ => return Err(BsoValidationError::InvalidSortindex),
        },
        Some(_) => return Err(BsoValidationError::InvalidSortindex),
    };
    if let Some(ref payload) = body.payload {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BsoValidationError::PayloadTooLarge);
        }
    }
    let ttl = match &body.ttl {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if v >= 0 && (v as u64) <= TTL_MAX => Some(v as u32),
            _ => return Err(BsoValidationError::InvalidTtl),
        },
        Some(_) => return Err(BsoValidationError::InvalidTtl),
    };
    Ok(ValidBso {
        id: id.to_owned(),
        sortindex,
        payload: body.payload.clone(),
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_bso() {
        let body = BsoBody {
            id: Some("abc".into()),
            sortindex: Some(Value::from(100)),
            payload: Some("hello".into()),
            ttl: Some(Value::from(3600)),
        };
        let bso = validate("abc", &body).expect("should validate");
        assert_eq!(bso.id, "abc");
        assert_eq!(bso.sortindex, Some(100));
        assert_eq!(bso.ttl, Some(3600));
    }

    #[test]
    fn rejects_oversized_payload() {
        let body = BsoBody {
            id: Some("abc".into()),
            sortindex: None,
            payload: Some("x".repeat(MAX_PAYLOAD_SIZE + 1)),
            ttl: None,
        };
        assert_eq!(
            validate("abc", &body).unwrap_err(),
            BsoValidationError::PayloadTooLarge
        );
    }

    #[test]
    fn rejects_sortindex_out_of_range() {
        let body = BsoBody {
            id: Some("abc".into()),
            sortindex: Some(Value::from(SORTINDEX_MAX + 1)),
            payload: None,
            ttl: None,
        };
        assert_eq!(
            validate("abc", &body).unwrap_err(),
            BsoValidationError::InvalidSortindex
        );
    }

    #[test]
    fn rejects_non_numeric_sortindex() {
        let body = BsoBody {
            id: Some("x2".into()),
            sortindex: Some(Value::from("notanint")),
            payload: None,
            ttl: None,
        };
        assert_eq!(
            validate("x2", &body).unwrap_err(),
            BsoValidationError::InvalidSortindex
        );
    }

    #[test]
    fn rejects_ttl_out_of_range() {
        let body = BsoBody {
            id: Some("abc".into()),
            sortindex: None,
            payload: None,
            ttl: Some(Value::from(TTL_MAX as i64 + 1)),
        };
        assert_eq!(
            validate("abc", &body).unwrap_err(),
            BsoValidationError::InvalidTtl
        );
    }

    #[test]
    fn rejects_empty_and_overlong_ids() {
        assert!(!validate_id(""));
        assert!(!validate_id(&"a".repeat(65)));
        assert!(validate_id(&"a".repeat(64)));
    }

    #[test]
    fn rejects_non_printable_ascii_id() {
        assert!(!validate_id("bad\u{0}id"));
    }
}
