//! Discovery advertiser — signed gateway announcements on a well-known topic.
//!
//! Gateways with open access advertise themselves so unowned clients can
//! find an entry point. An announcement is a fixed binary layout (every
//! field length-prefixed, numbers big-endian) carrying the gateway's URLs,
//! TTL, and a detached ed25519 signature over everything except the
//! signature itself. Clients verify with the embedded `signature_key`;
//! flipping any payload byte invalidates the signature.
//!
//! Probe connections receive the cached encoded announcement if it is
//! fresher than half the refresh interval; otherwise it is rebuilt first.
//! A background tick rebuilds unconditionally every `refresh_interval`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::crypto::{derive_signing_key, sha256_hex};
use crate::error::DiscoveryError;

/// The well-known 32-byte discovery topic.
pub const DISCOVERY_TOPIC: [u8; 32] = *b"hypertuna/gateway/discovery/v1\0\0";

/// Announcement wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Advertiser configuration.
#[derive(Debug, Clone)]
pub struct AdvertiserConfig {
    pub enabled: bool,
    /// Only open-access gateways advertise.
    pub open_access: bool,
    pub public_url: String,
    pub ws_url: String,
    /// Invite-style URL requiring the shared secret.
    pub secret_url: String,
    pub display_name: String,
    pub region: String,
    /// When set, `secret_hash` lets clients confirm they hold the right
    /// secret without revealing it.
    pub shared_secret: Option<String>,
    pub shared_secret_version: u32,
    /// Deterministic signing identity; random when absent.
    pub key_seed: Option<Vec<u8>>,
    pub refresh_interval: Duration,
    pub ttl_seconds: u64,
    /// Overlay listener address probes connect to.
    pub bind_addr: SocketAddr,
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            open_access: false,
            public_url: String::new(),
            ws_url: String::new(),
            secret_url: String::new(),
            display_name: String::new(),
            region: String::new(),
            shared_secret: None,
            shared_secret_version: 0,
            key_seed: None,
            refresh_interval: Duration::from_secs(30),
            ttl_seconds: 60,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 49737)),
        }
    }
}

/// A signed, TTL-bounded gateway descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAnnouncement {
    /// Hex of the signing public key; doubles as the gateway id.
    pub gateway_id: String,
    pub timestamp_ms: i64,
    pub ttl_seconds: u64,
    pub public_url: String,
    pub ws_url: String,
    pub secret_url: String,
    /// `sha256(shared_secret)` hex, or empty when no secret is set.
    pub secret_hash: String,
    pub open_access: bool,
    pub shared_secret_version: u32,
    pub display_name: String,
    pub region: String,
    pub protocol_version: u16,
    /// Hex ed25519 verifying key.
    pub signature_key: String,
    /// Hex detached signature over the canonical layout.
    pub signature: String,
}

impl GatewayAnnouncement {
    /// The canonical byte layout the signature covers: topic, then every
    /// field except `signature`, each length-prefixed or fixed-width.
    #[must_use]
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&DISCOVERY_TOPIC);
        put_str(&mut out, &self.gateway_id);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.ttl_seconds.to_be_bytes());
        put_str(&mut out, &self.public_url);
        put_str(&mut out, &self.ws_url);
        put_str(&mut out, &self.secret_url);
        put_str(&mut out, &self.secret_hash);
        out.push(u8::from(self.open_access));
        out.extend_from_slice(&self.shared_secret_version.to_be_bytes());
        put_str(&mut out, &self.display_name);
        put_str(&mut out, &self.region);
        out.extend_from_slice(&self.protocol_version.to_be_bytes());
        put_str(&mut out, &self.signature_key);
        out
    }

    /// Full wire encoding: the signable layout followed by the signature.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signable_bytes();
        put_str(&mut out, &self.signature);
        out
    }

    /// Decode a wire announcement.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Encoding`] on truncation, a topic mismatch,
    /// or invalid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let topic = cursor.take(32)?;
        if topic != DISCOVERY_TOPIC {
            return Err(DiscoveryError::Encoding {
                reason: "topic mismatch".to_owned(),
            });
        }
        let announcement = Self {
            gateway_id: cursor.take_str()?,
            timestamp_ms: i64::from_be_bytes(cursor.take_fixed()?),
            ttl_seconds: u64::from_be_bytes(cursor.take_fixed()?),
            public_url: cursor.take_str()?,
            ws_url: cursor.take_str()?,
            secret_url: cursor.take_str()?,
            secret_hash: cursor.take_str()?,
            open_access: cursor.take(1)?[0] != 0,
            shared_secret_version: u32::from_be_bytes(cursor.take_fixed()?),
            display_name: cursor.take_str()?,
            region: cursor.take_str()?,
            protocol_version: u16::from_be_bytes(cursor.take_fixed()?),
            signature_key: cursor.take_str()?,
            signature: cursor.take_str()?,
        };
        Ok(announcement)
    }

    /// Verify the detached signature under the embedded `signature_key`.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::Encoding`] for malformed key or signature hex.
    /// - [`DiscoveryError::BadSignature`] when verification fails.
    pub fn verify_signature(&self) -> Result<(), DiscoveryError> {
        let key_bytes: [u8; 32] = hex::decode(&self.signature_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DiscoveryError::Encoding {
                reason: "signature key not 32-byte hex".to_owned(),
            })?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| DiscoveryError::Encoding {
            reason: format!("bad verifying key: {e}"),
        })?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DiscoveryError::Encoding {
                reason: "signature not 64-byte hex".to_owned(),
            })?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(&self.signable_bytes(), &signature)
            .map_err(|_| DiscoveryError::BadSignature)
    }
}

struct Cached {
    encoded: Arc<Vec<u8>>,
    built_at: Instant,
}

/// Publishes signed announcements on the discovery overlay.
pub struct DiscoveryAdvertiser {
    config: AdvertiserConfig,
    signing_key: SigningKey,
    cache: RwLock<Option<Cached>>,
}

impl DiscoveryAdvertiser {
    /// Build an advertiser. The signing key derives deterministically from
    /// `key_seed` when provided, else a random identity is generated.
    #[must_use]
    pub fn new(config: AdvertiserConfig) -> Self {
        let signing_key = match &config.key_seed {
            Some(seed) => derive_signing_key(seed),
            None => {
                // Seed a random identity from CSPRNG material.
                let a = uuid::Uuid::new_v4();
                let b = uuid::Uuid::new_v4();
                let mut seed = Vec::with_capacity(32);
                seed.extend_from_slice(a.as_bytes());
                seed.extend_from_slice(b.as_bytes());
                derive_signing_key(&seed)
            }
        };
        Self {
            config,
            signing_key,
            cache: RwLock::new(None),
        }
    }

    /// Whether this gateway advertises at all.
    #[must_use]
    pub fn active(&self) -> bool {
        self.config.enabled && self.config.open_access
    }

    /// The advertiser's stable gateway id (hex verifying key).
    #[must_use]
    pub fn gateway_id(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Build and sign a fresh announcement.
    #[must_use]
    pub fn build_announcement(&self) -> GatewayAnnouncement {
        let signature_key = self.gateway_id();
        let secret_hash = self
            .config
            .shared_secret
            .as_deref()
            .map(|s| sha256_hex(s.as_bytes()))
            .unwrap_or_default();

        let mut announcement = GatewayAnnouncement {
            gateway_id: signature_key.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
            ttl_seconds: self.config.ttl_seconds,
            public_url: self.config.public_url.clone(),
            ws_url: self.config.ws_url.clone(),
            secret_url: self.config.secret_url.clone(),
            secret_hash,
            open_access: self.config.open_access,
            shared_secret_version: self.config.shared_secret_version,
            display_name: self.config.display_name.clone(),
            region: self.config.region.clone(),
            protocol_version: PROTOCOL_VERSION,
            signature_key,
            signature: String::new(),
        };
        let signature = self.signing_key.sign(&announcement.signable_bytes());
        announcement.signature = hex::encode(signature.to_bytes());
        announcement
    }

    /// The cached encoding, rebuilt first when older than half the refresh
    /// interval. The cached buffer itself is immutable; a rebuild swaps in
    /// a new one atomically.
    pub async fn encoded_announcement(&self) -> Arc<Vec<u8>> {
        let half = self.config.refresh_interval / 2;
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.built_at.elapsed() < half {
                    return Arc::clone(&cached.encoded);
                }
            }
        }
        self.rebuild().await
    }

    /// Serve announcements until shutdown. Each probe connection gets one
    /// frame, then the stream closes.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::Disabled`] when not `enabled` + `open_access`.
    /// - [`DiscoveryError::Io`] when the listener cannot bind.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        if !self.active() {
            return Err(DiscoveryError::Disabled);
        }

        let listener =
            TcpListener::bind(self.config.bind_addr)
                .await
                .map_err(|e| DiscoveryError::Io {
                    reason: format!("bind {}: {e}", self.config.bind_addr),
                })?;
        info!(addr = %self.config.bind_addr, gateway_id = %self.gateway_id(),
            "discovery advertiser listening");

        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            debug!(remote = %remote, "discovery probe");
                            let advertiser = Arc::clone(&self);
                            tokio::spawn(async move {
                                advertiser.serve_probe(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "discovery accept failed"),
                    }
                }
                _ = refresh.tick() => {
                    self.rebuild().await;
                }
                _ = shutdown.changed() => {
                    info!("discovery advertiser shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_probe(&self, stream: TcpStream) {
        let encoded = self.encoded_announcement().await;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        if let Err(e) = framed
            .send(tokio_util::bytes::Bytes::from(encoded.as_ref().clone()))
            .await
        {
            debug!(error = %e, "probe send failed");
        }
        // One frame per probe; the connection closes when framed drops.
    }

    async fn rebuild(&self) -> Arc<Vec<u8>> {
        let encoded = Arc::new(self.build_announcement().encode());
        let mut cache = self.cache.write().await;
        *cache = Some(Cached {
            encoded: Arc::clone(&encoded),
            built_at: Instant::now(),
        });
        encoded
    }
}

impl std::fmt::Debug for DiscoveryAdvertiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryAdvertiser")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&bytes[..usize::from(len)]);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DiscoveryError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_fixed<const N: usize>(&mut self) -> Result<[u8; N], DiscoveryError> {
        let slice = self.take(N)?;
        slice.try_into().map_err(|_| truncated())
    }

    fn take_str(&mut self) -> Result<String, DiscoveryError> {
        let len = u16::from_be_bytes(self.take_fixed()?);
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DiscoveryError::Encoding {
            reason: format!("invalid utf-8: {e}"),
        })
    }
}

fn truncated() -> DiscoveryError {
    DiscoveryError::Encoding {
        reason: "announcement truncated".to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn advertiser(open_access: bool) -> DiscoveryAdvertiser {
        DiscoveryAdvertiser::new(AdvertiserConfig {
            enabled: true,
            open_access,
            public_url: "https://gw.example.org".to_owned(),
            ws_url: "wss://gw.example.org/relay".to_owned(),
            secret_url: "https://gw.example.org/join".to_owned(),
            display_name: "example gateway".to_owned(),
            region: "eu-west".to_owned(),
            shared_secret: Some("hunter2".to_owned()),
            shared_secret_version: 3,
            key_seed: Some(b"stable-seed".to_vec()),
            ..AdvertiserConfig::default()
        })
    }

    #[test]
    fn announcement_signature_verifies() {
        let announcement = advertiser(true).build_announcement();
        announcement.verify_signature().unwrap();
    }

    #[test]
    fn mutating_any_field_breaks_the_signature() {
        let mut announcement = advertiser(true).build_announcement();
        // Flip one byte of the public URL.
        announcement.public_url = announcement.public_url.replace("gw", "gx");
        assert!(matches!(
            announcement.verify_signature(),
            Err(DiscoveryError::BadSignature)
        ));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let announcement = advertiser(true).build_announcement();
        let decoded = GatewayAnnouncement::decode(&announcement.encode()).unwrap();
        assert_eq!(decoded, announcement);
        decoded.verify_signature().unwrap();
    }

    #[test]
    fn decode_rejects_wrong_topic() {
        let announcement = advertiser(true).build_announcement();
        let mut bytes = announcement.encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            GatewayAnnouncement::decode(&bytes),
            Err(DiscoveryError::Encoding { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let announcement = advertiser(true).build_announcement();
        let bytes = announcement.encode();
        assert!(GatewayAnnouncement::decode(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn secret_hash_commits_to_the_secret_without_revealing_it() {
        let announcement = advertiser(true).build_announcement();
        assert_eq!(announcement.secret_hash, sha256_hex(b"hunter2"));
        assert!(!announcement.encode().windows(7).any(|w| w == b"hunter2"));
    }

    #[test]
    fn no_shared_secret_means_empty_hash() {
        let advertiser = DiscoveryAdvertiser::new(AdvertiserConfig {
            enabled: true,
            open_access: true,
            key_seed: Some(b"seed".to_vec()),
            ..AdvertiserConfig::default()
        });
        assert!(advertiser.build_announcement().secret_hash.is_empty());
    }

    #[test]
    fn closed_gateway_is_not_active() {
        assert!(!advertiser(false).active());
        assert!(advertiser(true).active());
    }

    #[test]
    fn seeded_identity_is_deterministic() {
        let a = advertiser(true);
        let b = advertiser(true);
        assert_eq!(a.gateway_id(), b.gateway_id());
    }

    #[tokio::test]
    async fn run_refuses_when_inactive() {
        let advertiser = Arc::new(DiscoveryAdvertiser::new(AdvertiserConfig::default()));
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            advertiser.run(rx).await,
            Err(DiscoveryError::Disabled)
        ));
    }

    #[tokio::test]
    async fn cached_encoding_is_reused_within_half_interval() {
        let advertiser = advertiser(true);
        let first = advertiser.encoded_announcement().await;
        let second = advertiser.encoded_announcement().await;
        assert!(Arc::ptr_eq(&first, &second));
    }
}
