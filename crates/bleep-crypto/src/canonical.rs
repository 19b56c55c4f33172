//! Deterministic, key-sorted JSON serialisation and SHA-256 hex digests.
//!
//! `serde_json::Map` is a `BTreeMap` as long as the `preserve_order` feature
//! is not enabled anywhere in the dependency graph (it isn't here), so
//! round-tripping through `serde_json::Value` already yields key-sorted
//! output. We go through `Value` explicitly so that this holds regardless
//! of how a caller's struct derives `Serialize`.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialise `value` to canonical (key-sorted, no whitespace) JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let as_value = serde_json::to_value(value)?;
    serde_json::to_string(&as_value)
}

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonicalise `value` and hash it: the digest used for transaction
/// authentication tags, content hashes and block hashes.
pub fn hash_canonical<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let encoded = canonical_json(value)?;
    Ok(sha256_hex(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&value).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn hash_canonical_is_deterministic() {
        let value = json!({"sender": "alice", "amount": 10});
        let h1 = hash_canonical(&value).unwrap();
        let h2 = hash_canonical(&value).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn hash_canonical_ignores_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }
}
