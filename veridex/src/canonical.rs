//! Canonical JSON, content hashing, and HMAC payload signing.
//!
//! Canonical form: UTF-8, keys sorted at every level, compact separators, no
//! trailing newline. The same bytes feed both SHA-256 content hashing and
//! HMAC-SHA256 signing, so two structurally equal documents always hash and
//! sign identically regardless of key insertion order.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::{ServiceError, ServiceResult};

type HmacSha256 = Hmac<Sha256>;

/// Signature replay window applied when a timestamp accompanies a signature.
pub const DEFAULT_MAX_SIGNATURE_AGE_SECS: i64 = 300;

/// Serialize `value` to its canonical byte form.
///
/// `serde_json` object maps are ordered (BTreeMap-backed), so serializing is
/// already key-sorted at all levels; `to_string` emits compact separators.
pub fn canonical_json(value: &Value) -> ServiceResult<String> {
    serde_json::to_string(value)
        .map_err(|e| ServiceError::Internal(format!("canonical serialization failed: {}", e)))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the canonical form of a JSON document.
pub fn hash_value(value: &Value) -> ServiceResult<String> {
    Ok(sha256_hex(canonical_json(value)?))
}

fn signing_payload(value: &Value, timestamp: Option<i64>) -> ServiceResult<Vec<u8>> {
    let canonical = canonical_json(value)?;
    Ok(match timestamp {
        Some(ts) => format!("{}:{}", ts, canonical).into_bytes(),
        None => canonical.into_bytes(),
    })
}

/// HMAC-SHA256 hex signature of the canonical payload.
///
/// When `timestamp` is provided it is prefixed to the payload so a verifier
/// can enforce a replay window.
pub fn hmac_sign(value: &Value, key: &[u8], timestamp: Option<i64>) -> ServiceResult<String> {
    if key.is_empty() {
        return Err(ServiceError::InvalidInput(
            "signing key must not be empty".to_string(),
        ));
    }
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ServiceError::Internal(format!("hmac init failed: {}", e)))?;
    mac.update(&signing_payload(value, timestamp)?);
    Ok(format!("{:x}", mac.finalize().into_bytes()))
}

/// Constant-time hex digest comparison.
fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify an HMAC signature against the canonical payload.
///
/// Accepts iff the key and canonical payload match and, when a timestamp is
/// present, `now - timestamp <= max_age_secs`.
pub fn hmac_verify(
    value: &Value,
    signature: &str,
    key: &[u8],
    timestamp: Option<i64>,
    max_age_secs: i64,
    now: i64,
) -> bool {
    if signature.is_empty() || key.is_empty() {
        return false;
    }
    if let Some(ts) = timestamp {
        if now - ts > max_age_secs {
            return false;
        }
    }
    match hmac_sign(value, key, timestamp) {
        Ok(expected) => digest_eq(&expected, signature),
        Err(_) => false,
    }
}

/// Hash-and-sign metadata attached to outbound sensitive payloads.
pub fn signing_metadata(value: &Value, key: &[u8], now: i64) -> ServiceResult<Value> {
    let signature = hmac_sign(value, key, Some(now))?;
    Ok(serde_json::json!({
        "data_hash": hash_value(value)?,
        "signature": signature,
        "algorithm": "HMAC-SHA256",
        "version": "1.0",
        "timestamp": now,
        "expires_at": now + DEFAULT_MAX_SIGNATURE_AGE_SECS,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b":2,"a":1,"nested":{"y":0,"x":[1,2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"nested":{"x":[1,2],"y":0},"a":1,"b":2}"#).unwrap();
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(
            canonical_json(&a).unwrap(),
            r#"{"a":1,"b":2,"nested":{"x":[1,2],"y":0}}"#
        );
    }

    #[test]
    fn test_sha256_known_vectors() {
        assert_eq!(
            sha256_hex("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_value_deterministic() {
        let a = json!({"key": "value", "number": 42});
        let b = json!({"number": 42, "key": "value"});
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
        assert_ne!(
            hash_value(&json!({"action": "test1"})).unwrap(),
            hash_value(&json!({"action": "test2"})).unwrap()
        );
    }

    #[test]
    fn test_hmac_roundtrip() {
        let payload = json!({"workflow_id": "wf-1", "amount": 250});
        let sig = hmac_sign(&payload, b"secret", Some(1_000)).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(hmac_verify(&payload, &sig, b"secret", Some(1_000), 300, 1_100));
    }

    #[test]
    fn test_hmac_rejects_wrong_key_and_tamper() {
        let payload = json!({"v": 1});
        let sig = hmac_sign(&payload, b"secret", None).unwrap();
        assert!(!hmac_verify(&payload, &sig, b"other", None, 300, 0));
        assert!(!hmac_verify(&json!({"v": 2}), &sig, b"secret", None, 300, 0));
        assert!(!hmac_verify(&payload, "", b"secret", None, 300, 0));
    }

    #[test]
    fn test_hmac_rejects_expired_timestamp() {
        let payload = json!({"v": 1});
        let sig = hmac_sign(&payload, b"secret", Some(1_000)).unwrap();
        assert!(hmac_verify(&payload, &sig, b"secret", Some(1_000), 300, 1_300));
        assert!(!hmac_verify(&payload, &sig, b"secret", Some(1_000), 300, 1_301));
    }

    #[test]
    fn test_signing_metadata_shape() {
        let meta = signing_metadata(&json!({"a": 1}), b"k", 500).unwrap();
        assert_eq!(meta["algorithm"], "HMAC-SHA256");
        assert_eq!(meta["timestamp"], 500);
        assert_eq!(meta["expires_at"], 800);
        assert_eq!(meta["data_hash"].as_str().unwrap().len(), 64);
    }
}
