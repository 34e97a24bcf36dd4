//! Sealed payloads — authenticated public-key encryption for writer keys.
//!
//! A worker peer seals its writer key to the gateway's escrow recipient key
//! before depositing it; the escrow service stores the blob without being
//! able to read it. Sealing uses an ephemeral x25519 key agreement with the
//! recipient, HKDF-SHA256 to derive the symmetric key, and ChaCha20-Poly1305
//! for the authenticated encryption. The wire form carries base64
//! `ciphertext`, `nonce`, and `sender_public_key` — everything a holder of
//! the recipient secret needs to open it, and nothing anyone else can use.
//!
//! # Security model
//!
//! - A fresh ephemeral sender key per seal; compromise of one sealed blob
//!   reveals nothing about others.
//! - The AEAD tag authenticates ciphertext and nonce; any tampering fails
//!   the open.
//! - Key derivation is salted with both public keys so the same shared
//!   secret never keys two directions identically.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::SealedError;

/// HKDF info string for the sealed-payload symmetric key.
const SEALED_KEY_INFO: &[u8] = b"hypertuna-sealed-payload-v1";

/// Nonce length for ChaCha20-Poly1305 (96 bits).
const NONCE_LEN: usize = 12;

/// An authenticated public-key-encrypted blob.
///
/// All fields are base64. Serializes with the camelCase field names the
/// escrow wire uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SealedPayload {
    /// Base64 ciphertext (includes the AEAD tag).
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub nonce: String,
    /// Base64 ephemeral sender public key (32 bytes).
    pub sender_public_key: String,
}

/// Generate a recipient keypair for opening sealed payloads.
///
/// The secret half belongs in gateway configuration; the public half is
/// handed to worker peers so they can seal deposits.
#[must_use]
pub fn generate_recipient_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Seal `plaintext` to `recipient`, producing a self-contained blob.
///
/// # Errors
///
/// Returns [`SealedError::SealingFailed`] if the AEAD operation fails.
pub fn seal_payload(recipient: &PublicKey, plaintext: &[u8]) -> Result<SealedPayload, SealedError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let sender_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_sealed_key(shared.as_bytes(), &sender_public, recipient)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SealedError::SealingFailed {
            reason: e.to_string(),
        })?;

    Ok(SealedPayload {
        ciphertext: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce),
        sender_public_key: BASE64.encode(sender_public.as_bytes()),
    })
}

/// Open a sealed payload with the recipient secret key.
///
/// # Errors
///
/// - [`SealedError::BadEncoding`] if any base64 field or key length is wrong.
/// - [`SealedError::OpeningFailed`] if authentication fails (wrong recipient
///   key, corrupted data, or tampered tag).
pub fn open_payload(
    recipient_secret: &StaticSecret,
    sealed: &SealedPayload,
) -> Result<Vec<u8>, SealedError> {
    let sender_bytes = decode_field("senderPublicKey", &sealed.sender_public_key)?;
    let sender_public = PublicKey::from(to_key_array(&sender_bytes)?);

    let nonce_bytes = decode_field("nonce", &sealed.nonce)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(SealedError::BadEncoding {
            reason: format!("nonce must be {NONCE_LEN} bytes, got {}", nonce_bytes.len()),
        });
    }
    let ciphertext = decode_field("ciphertext", &sealed.ciphertext)?;

    let recipient_public = PublicKey::from(recipient_secret);
    let shared = recipient_secret.diffie_hellman(&sender_public);
    let key = derive_sealed_key(shared.as_bytes(), &sender_public, &recipient_public)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|e| SealedError::OpeningFailed {
            reason: e.to_string(),
        })
}

/// HKDF-SHA256 over the DH shared secret, salted with both public keys.
fn derive_sealed_key(
    shared: &[u8],
    sender: &PublicKey,
    recipient: &PublicKey,
) -> Result<[u8; 32], SealedError> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(sender.as_bytes());
    salt.extend_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hk.expand(SEALED_KEY_INFO, &mut key)
        .map_err(|e| SealedError::SealingFailed {
            reason: format!("key derivation failed: {e}"),
        })?;
    Ok(key)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, SealedError> {
    BASE64.decode(value).map_err(|e| SealedError::BadEncoding {
        reason: format!("{name} not base64: {e}"),
    })
}

fn to_key_array(bytes: &[u8]) -> Result<[u8; 32], SealedError> {
    <[u8; 32]>::try_from(bytes).map_err(|_| SealedError::BadEncoding {
        reason: format!("public key must be 32 bytes, got {}", bytes.len()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let (secret, public) = generate_recipient_keypair();
        let sealed = seal_payload(&public, b"writer key bytes").unwrap();
        let opened = open_payload(&secret, &sealed).unwrap();
        assert_eq!(opened, b"writer key bytes");
    }

    #[test]
    fn seal_open_empty_plaintext() {
        let (secret, public) = generate_recipient_keypair();
        let sealed = seal_payload(&public, b"").unwrap();
        let opened = open_payload(&secret, &sealed).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn open_with_wrong_recipient_fails() {
        let (_, public) = generate_recipient_keypair();
        let (other_secret, _) = generate_recipient_keypair();
        let sealed = seal_payload(&public, b"secret").unwrap();
        let result = open_payload(&other_secret, &sealed);
        assert!(matches!(result, Err(SealedError::OpeningFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let (secret, public) = generate_recipient_keypair();
        let mut sealed = seal_payload(&public, b"secret").unwrap();
        let mut raw = BASE64.decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0xFF;
        sealed.ciphertext = BASE64.encode(raw);
        let result = open_payload(&secret, &sealed);
        assert!(matches!(result, Err(SealedError::OpeningFailed { .. })));
    }

    #[test]
    fn two_seals_produce_different_blobs() {
        let (_, public) = generate_recipient_keypair();
        let s1 = seal_payload(&public, b"same data").unwrap();
        let s2 = seal_payload(&public, b"same data").unwrap();
        // Fresh ephemeral keys and nonces per seal.
        assert_ne!(s1.ciphertext, s2.ciphertext);
        assert_ne!(s1.sender_public_key, s2.sender_public_key);
    }

    #[test]
    fn malformed_base64_is_rejected() {
        let (secret, _) = generate_recipient_keypair();
        let sealed = SealedPayload {
            ciphertext: "!!not-base64!!".to_owned(),
            nonce: BASE64.encode([0u8; 12]),
            sender_public_key: BASE64.encode([0u8; 32]),
        };
        let result = open_payload(&secret, &sealed);
        assert!(matches!(result, Err(SealedError::BadEncoding { .. })));
    }

    #[test]
    fn wrong_nonce_length_is_rejected() {
        let (secret, public) = generate_recipient_keypair();
        let mut sealed = seal_payload(&public, b"x").unwrap();
        sealed.nonce = BASE64.encode([0u8; 8]);
        let result = open_payload(&secret, &sealed);
        assert!(matches!(result, Err(SealedError::BadEncoding { .. })));
    }
}
