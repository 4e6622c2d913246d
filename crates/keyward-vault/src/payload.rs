//! Canonical byte form of secret payloads.
//!
//! A payload is any JSON value. Before encryption it is rendered as one
//! format byte followed by compact JSON with every object's keys sorted, so
//! two equal values always produce identical bytes and identical digests.

use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Current payload format: sorted-key compact JSON.
pub const FORMAT_JSON_V1: u8 = 1;

/// Render `value` in canonical form.
pub fn encode(value: &Value) -> Result<Zeroizing<Vec<u8>>> {
    let canonical = canonicalize(value);
    let mut out = Zeroizing::new(vec![FORMAT_JSON_V1]);
    serde_json::to_writer(&mut *out, &canonical)?;
    Ok(out)
}

/// Parse bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Value> {
    match bytes.split_first() {
        Some((&FORMAT_JSON_V1, body)) => Ok(serde_json::from_slice(body)?),
        Some((format, _)) => Err(VaultError::DecryptionFailed {
            reason: format!("unsupported payload format {format}"),
        }),
        None => Err(VaultError::DecryptionFailed {
            reason: "empty payload".into(),
        }),
    }
}

/// Rebuild `value` with object keys in ascending order at every depth.
///
/// Insertion order is made explicit so the result does not depend on
/// whether `serde_json` preserves insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_bytes() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":true,"x":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":null,"y":true},"b":1}"#).unwrap();
        assert_eq!(*encode(&a).unwrap(), *encode(&b).unwrap());
    }

    #[test]
    fn encoding_is_compact_and_prefixed() {
        let bytes = encode(&json!({"user": "admin", "port": 5432})).unwrap();
        assert_eq!(bytes[0], FORMAT_JSON_V1);
        assert_eq!(&bytes[1..], br#"{"port":5432,"user":"admin"}"#);
    }

    #[test]
    fn decode_restores_value() {
        let value = json!({"host": "db.internal", "tags": ["a", "b"], "n": 1.5});
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn plain_strings_are_payloads() {
        let bytes = encode(&Value::String("sk-test-1234".into())).unwrap();
        assert_eq!(&bytes[1..], br#""sk-test-1234""#);
    }

    #[test]
    fn unknown_format_rejected() {
        assert!(decode(b"\x02{}").is_err());
        assert!(decode(b"").is_err());
    }
}
