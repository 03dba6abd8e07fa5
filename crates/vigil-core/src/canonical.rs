//! # Canonical Serialization
//!
//! Defines [`CanonicalBytes`], the sole construction path for bytes used in
//! digest computation across the workspace.
//!
//! ## Security Invariant
//!
//! The inner `Vec<u8>` is private. The only way to construct `CanonicalBytes`
//! is through [`CanonicalBytes::new()`], which emits the JSON Canonicalization
//! Scheme (RFC 8785) via `serde_jcs`:
//!
//! 1. Object keys sorted by UTF-16 code units.
//! 2. Compact separators (no whitespace).
//! 3. Numbers in ECMAScript form (`1.0` becomes `1`).
//!
//! Two structurally equal values therefore always produce identical bytes,
//! independent of map insertion order.

use serde::Serialize;
use serde_json::Value;

use crate::error::CanonicalizationError;

/// Bytes produced exclusively by canonical JSON serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Construct canonical bytes from any serializable value.
    pub fn new(obj: &impl Serialize) -> Result<Self, CanonicalizationError> {
        let value: Value = serde_json::to_value(obj)?;
        Ok(Self(serde_jcs::to_vec(&value)?))
    }

    /// Access the canonical bytes for digest computation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume and return the inner byte vector.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Returns the length of the canonical byte sequence.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the canonical byte sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let cb = CanonicalBytes::new(&json!({"b": 1, "a": [true, null], "c": {"z": "x", "y": 2}}))
            .unwrap();
        assert_eq!(
            std::str::from_utf8(cb.as_bytes()).unwrap(),
            r#"{"a":[true,null],"b":1,"c":{"y":2,"z":"x"}}"#
        );
    }

    #[test]
    fn floats_are_permitted() {
        let cb = CanonicalBytes::new(&json!({"risk_score": 87.5})).unwrap();
        assert_eq!(
            std::str::from_utf8(cb.as_bytes()).unwrap(),
            r#"{"risk_score":87.5}"#
        );
    }

    #[test]
    fn integral_floats_use_ecmascript_form() {
        let cb = CanonicalBytes::new(&json!({"threshold": 85.0})).unwrap();
        assert_eq!(std::str::from_utf8(cb.as_bytes()).unwrap(), r#"{"threshold":85}"#);
    }

    #[test]
    fn keys_sort_by_utf16_code_units() {
        // U+10000 encodes as surrogate 0xD800, which sorts before 0xE000
        // even though its UTF-8 bytes sort after.
        let cb = CanonicalBytes::new(&json!({"\u{e000}": 2, "\u{10000}": 1})).unwrap();
        assert_eq!(
            std::str::from_utf8(cb.as_bytes()).unwrap(),
            "{\"\u{10000}\":1,\"\u{e000}\":2}"
        );
    }

    #[test]
    fn strings_are_escaped() {
        let cb = CanonicalBytes::new(&json!({"msg": "quote \" and \\"})).unwrap();
        let text = std::str::from_utf8(cb.as_bytes()).unwrap();
        assert_eq!(text, r#"{"msg":"quote \" and \\"}"#);
    }

    #[test]
    fn deterministic_across_calls() {
        let v = json!({"policy": "p-1", "priority": 95});
        assert_eq!(CanonicalBytes::new(&v).unwrap(), CanonicalBytes::new(&v).unwrap());
    }

    proptest::proptest! {
        #[test]
        fn insertion_order_does_not_matter(a in 0i64..1000, b in "[a-z]{0,12}") {
            let mut m1 = serde_json::Map::new();
            m1.insert("alpha".into(), json!(a));
            m1.insert("beta".into(), json!(b.clone()));
            let mut m2 = serde_json::Map::new();
            m2.insert("beta".into(), json!(b));
            m2.insert("alpha".into(), json!(a));
            proptest::prop_assert_eq!(
                CanonicalBytes::new(&m1).unwrap(),
                CanonicalBytes::new(&m2).unwrap()
            );
        }
    }
}
