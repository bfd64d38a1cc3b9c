//! Content hashing for idempotent writes and cache keys
//!
//! Hashes are computed over a canonical JSON rendering: object keys are sorted
//! recursively and no insignificant whitespace is emitted, so two payloads that
//! differ only in key order hash identically.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Render a JSON value canonically (recursively sorted object keys)
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of raw bytes as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content hash of a JSON value (SHA-256 over its canonical form)
pub fn content_hash(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Hash an ordered sequence of string parts into a short stable digest.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn short_digest<'a>(parts: impl IntoIterator<Item = &'a str>, len: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(len.min(64));
    digest
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [ {"d": 1, "c": 2} ]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({"sku": "A-1", "qty": 3, "price_minor": 150000});
        let b = json!({"price_minor": 150000, "sku": "A-1", "qty": 3});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_detects_value_change() {
        let a = json!({"sku": "A-1", "qty": 3});
        let b = json!({"sku": "A-1", "qty": 4});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_short_digest_is_length_prefixed() {
        let a = short_digest(["ab", "c"], 16);
        let b = short_digest(["a", "bc"], 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_eq!(a, short_digest(["ab", "c"], 16));
    }

    proptest! {
        #[test]
        fn prop_content_hash_ignores_insertion_order(
            fields in proptest::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 1..20),
        ) {
            let forward: Map<String, Value> =
                fields.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let mut reversed = Map::new();
            for (k, v) in fields.iter().rev() {
                reversed.insert(k.clone(), json!(v));
            }

            let hash = content_hash(&Value::Object(forward));
            prop_assert_eq!(hash.len(), 64);
            prop_assert_eq!(hash, content_hash(&Value::Object(reversed)));
        }
    }
}
