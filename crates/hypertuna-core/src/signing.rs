//! Canonical JSON and HMAC request signing.
//!
//! Every signed surface in the gateway (escrow requests, token endpoints,
//! registration proofs) authenticates the same way: an HMAC-SHA256 over
//! `"{ts}:{client_id}:{body}"` where `body` is the canonical JSON encoding
//! of the payload. Canonical means object keys sorted at every level and
//! arrays kept in order, so both sides derive the same bytes regardless of
//! how their JSON library orders maps.
//!
//! Verification uses constant-time comparison (`subtle`) and rejects
//! requests whose timestamp falls outside the clock tolerance window
//! (default 5 minutes).

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::SigningError;

type HmacSha256 = Hmac<Sha256>;

/// Default clock tolerance for signed requests: 5 minutes.
pub const DEFAULT_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// Encode a JSON value canonically: object keys sorted at every level,
/// arrays in their original order, scalars as serde_json renders them.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are strings; serde_json handles escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Sign a request body, returning the hex-encoded HMAC-SHA256.
///
/// The signed message is `"{ts_ms}:{client_id}:{canonical_json(body)}"`.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn sign_request(secret: &[u8], client_id: &str, body: &Value, ts_ms: i64) -> String {
    let message = signing_message(client_id, body, ts_ms);
    // HMAC-SHA256 accepts any key length per RFC 2104, so new_from_slice
    // will never fail here.
    #[allow(clippy::unwrap_used)]
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signed request against the current wall clock.
///
/// # Errors
///
/// - [`SigningError::Expired`] when `|now - ts_ms| > tolerance_ms`.
/// - [`SigningError::BadEncoding`] when the signature is not valid hex.
/// - [`SigningError::InvalidSignature`] when the HMAC does not match.
pub fn verify_request(
    secret: &[u8],
    client_id: &str,
    body: &Value,
    ts_ms: i64,
    signature_hex: &str,
    tolerance_ms: i64,
) -> Result<(), SigningError> {
    verify_request_at(
        secret,
        client_id,
        body,
        ts_ms,
        signature_hex,
        tolerance_ms,
        Utc::now().timestamp_millis(),
    )
}

/// Verify a signed request against an explicit `now` (for tests and replay
/// of recorded traffic).
///
/// # Errors
///
/// Same as [`verify_request`].
pub fn verify_request_at(
    secret: &[u8],
    client_id: &str,
    body: &Value,
    ts_ms: i64,
    signature_hex: &str,
    tolerance_ms: i64,
    now_ms: i64,
) -> Result<(), SigningError> {
    if (now_ms - ts_ms).abs() > tolerance_ms {
        return Err(SigningError::Expired { ts_ms, tolerance_ms });
    }

    let presented = hex::decode(signature_hex).map_err(|e| SigningError::BadEncoding {
        reason: format!("signature not hex: {e}"),
    })?;

    let expected = sign_request(secret, client_id, body, ts_ms);
    let expected_bytes = hex::decode(&expected).map_err(|e| SigningError::BadEncoding {
        reason: e.to_string(),
    })?;

    if presented.len() != expected_bytes.len()
        || presented.ct_eq(&expected_bytes).unwrap_u8() != 1
    {
        return Err(SigningError::InvalidSignature {
            client_id: client_id.to_owned(),
        });
    }

    Ok(())
}

fn signing_message(client_id: &str, body: &Value, ts_ms: i64) -> String {
    format!("{ts_ms}:{client_id}:{}", canonical_json(body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"gateway-shared-secret";

    #[test]
    fn canonical_sorts_keys_at_every_level() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 1, 2]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[3,1,2],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_preserves_array_order() {
        let value = json!(["z", "a", {"k": null}]);
        assert_eq!(canonical_json(&value), r#"["z","a",{"k":null}]"#);
    }

    #[test]
    fn canonical_is_insensitive_to_insertion_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn sign_verify_roundtrip_within_tolerance() {
        let body = json!({"escrowId": "e-1", "requesterId": "gw-1"});
        let ts = 1_700_000_000_000;
        let sig = sign_request(SECRET, "client-a", &body, ts);
        verify_request_at(SECRET, "client-a", &body, ts, &sig, DEFAULT_TOLERANCE_MS, ts + 1000)
            .unwrap();
    }

    #[test]
    fn verify_rejects_outside_tolerance() {
        let body = json!({"escrowId": "e-1"});
        let ts = 1_700_000_000_000;
        let sig = sign_request(SECRET, "client-a", &body, ts);
        let err = verify_request_at(
            SECRET,
            "client-a",
            &body,
            ts,
            &sig,
            DEFAULT_TOLERANCE_MS,
            ts + DEFAULT_TOLERANCE_MS + 1,
        )
        .unwrap_err();
        assert!(matches!(err, SigningError::Expired { .. }));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let body = json!({"amount": 10});
        let ts = 1_700_000_000_000;
        let sig = sign_request(SECRET, "client-a", &body, ts);
        let tampered = json!({"amount": 11});
        let err =
            verify_request_at(SECRET, "client-a", &tampered, ts, &sig, DEFAULT_TOLERANCE_MS, ts)
                .unwrap_err();
        assert!(matches!(err, SigningError::InvalidSignature { .. }));
    }

    #[test]
    fn verify_rejects_wrong_client_id() {
        let body = json!({"amount": 10});
        let ts = 1_700_000_000_000;
        let sig = sign_request(SECRET, "client-a", &body, ts);
        let err =
            verify_request_at(SECRET, "client-b", &body, ts, &sig, DEFAULT_TOLERANCE_MS, ts)
                .unwrap_err();
        assert!(matches!(err, SigningError::InvalidSignature { .. }));
    }

    #[test]
    fn verify_rejects_non_hex_signature() {
        let body = json!({});
        let err = verify_request_at(SECRET, "c", &body, 0, "not-hex!", DEFAULT_TOLERANCE_MS, 0)
            .unwrap_err();
        assert!(matches!(err, SigningError::BadEncoding { .. }));
    }

    #[test]
    fn signature_differs_per_secret() {
        let body = json!({"k": "v"});
        let s1 = sign_request(b"secret-one", "c", &body, 5);
        let s2 = sign_request(b"secret-two", "c", &body, 5);
        assert_ne!(s1, s2);
    }
}
