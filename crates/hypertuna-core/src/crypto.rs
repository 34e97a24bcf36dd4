//! Secret-buffer primitives and key derivation.
//!
//! Writer keys delegated by worker peers are the most sensitive material the
//! gateway handles. They live in [`WriterKey`] — a zeroize-on-drop newtype
//! whose bytes never appear in `Debug` output — and transient copies go
//! through [`with_zeroized_buffer`], which guarantees the scratch buffer is
//! wiped on every exit path, including panics and early returns.
//!
//! # Security model
//!
//! - `WriterKey` derives `Zeroize` + `ZeroizeOnDrop`; dropping any copy wipes it.
//! - Digests bind a key to its identity without exposing the bytes:
//!   `payload_digest = sha256(key || identity)`.
//! - Announcement signing keys derive deterministically from an operator seed
//!   via HKDF-SHA256 so a gateway keeps its identity across restarts.

use std::fmt;

use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// HKDF info string for deriving a discovery signing key from a seed.
const DISCOVERY_KEY_INFO: &[u8] = b"hypertuna-discovery-key-v1";

/// A writer key delegated through escrow. Zeroized on drop.
///
/// The inner bytes are never exposed in `Debug` output. Cloning produces an
/// independent buffer that is itself zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WriterKey(Vec<u8>);

impl WriterKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care — the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex SHA-256 of the key bytes alone. Safe to log and persist.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        sha256_hex(&self.0)
    }

    /// Whether every byte is zero (used by tests to observe wiping).
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterKey")
            .field("bytes", &"[REDACTED]")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest binding a writer key to its identity string:
/// `sha256(key_bytes || identity)`. Never exposes the key.
#[must_use]
pub fn payload_digest(key: &WriterKey, identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run `handler` against a mutable scratch copy of `source`, wiping the copy
/// on every exit path — normal return, `Err`, or unwind.
///
/// The wipe is carried by [`Zeroizing`]'s destructor, so it also covers
/// handlers that return early.
pub fn with_zeroized_buffer<R>(source: &[u8], handler: impl FnOnce(&mut [u8]) -> R) -> R {
    let mut scratch = Zeroizing::new(source.to_vec());
    handler(scratch.as_mut_slice())
}

/// Derive an ed25519 signing key from an operator-provided seed.
///
/// Deterministic: the same seed always yields the same key, so a gateway
/// announced under this key keeps its identity across restarts.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn derive_signing_key(seed: &[u8]) -> SigningKey {
    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut derived = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit; expand cannot fail.
    #[allow(clippy::unwrap_used)]
    hk.expand(DISCOVERY_KEY_INFO, &mut derived).unwrap();
    let key = SigningKey::from_bytes(&derived);
    derived.zeroize();
    key
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn writer_key_debug_redacts_bytes() {
        let key = WriterKey::from_bytes(vec![0xAA; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("aa"));
    }

    #[test]
    fn writer_key_zeroize_wipes_in_place() {
        let mut key = WriterKey::from_bytes(vec![0x42; 32]);
        key.zeroize();
        assert!(key.is_zeroed());
    }

    #[test]
    fn payload_digest_is_stable_and_key_free() {
        let key = WriterKey::from_bytes(vec![7; 32]);
        let d1 = payload_digest(&key, "relay-key-1");
        let d2 = payload_digest(&key, "relay-key-1");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert!(!d1.contains("07070707"));
    }

    #[test]
    fn payload_digest_differs_per_identity() {
        let key = WriterKey::from_bytes(vec![7; 32]);
        assert_ne!(payload_digest(&key, "a"), payload_digest(&key, "b"));
    }

    #[test]
    fn with_zeroized_buffer_hands_out_a_copy() {
        let source = vec![1u8, 2, 3, 4];
        let sum = with_zeroized_buffer(&source, |buf| {
            buf[0] = 99;
            buf.iter().map(|b| u32::from(*b)).sum::<u32>()
        });
        assert_eq!(sum, 99 + 2 + 3 + 4);
        // Source is untouched; only the scratch copy was mutated and wiped.
        assert_eq!(source, vec![1, 2, 3, 4]);
    }

    #[test]
    fn with_zeroized_buffer_propagates_errors() {
        let out: Result<(), &str> = with_zeroized_buffer(&[1, 2, 3], |_| Err("boom"));
        assert_eq!(out, Err("boom"));
    }

    #[test]
    fn derive_signing_key_is_deterministic() {
        let k1 = derive_signing_key(b"seed-material");
        let k2 = derive_signing_key(b"seed-material");
        assert_eq!(k1.to_bytes(), k2.to_bytes());
    }

    #[test]
    fn derive_signing_key_differs_per_seed() {
        let k1 = derive_signing_key(b"seed-one");
        let k2 = derive_signing_key(b"seed-two");
        assert_ne!(k1.to_bytes(), k2.to_bytes());
    }
}
