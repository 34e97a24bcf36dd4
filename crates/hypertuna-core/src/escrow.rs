//! Escrow REST client.
//!
//! The gateway brokers writer-key delegation through an escrow service:
//! worker peers deposit sealed writer keys, and the gateway unlocks them as
//! time-bounded leases. Every request is authenticated with the
//! `X-Escrow-Client-Id` / `X-Escrow-Timestamp` / `X-Escrow-Signature`
//! header trio — an HMAC-SHA256 over the canonical body with a 5-minute
//! clock tolerance on the receiving side.
//!
//! Transport failures and 5xx responses retry with exponential backoff
//! inside the call deadline (default 10 s). Other non-2xx responses surface
//! as [`EscrowError::Api`] with the status code and parsed body preserved.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use x25519_dalek::StaticSecret;

use crate::crypto::WriterKey;
use crate::error::EscrowError;
use crate::sealed::{open_payload, SealedPayload};
use crate::signing::sign_request;
use crate::vault::Lease;

/// Signed-header names shared with the escrow service.
pub const HEADER_CLIENT_ID: &str = "X-Escrow-Client-Id";
pub const HEADER_TIMESTAMP: &str = "X-Escrow-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Escrow-Signature";

/// Default per-call deadline.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// First retry backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Escrow service policy, fetched before depositing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowPolicy {
    /// Longest lease the service will grant, in seconds.
    pub max_lease_seconds: i64,
    /// Whether unlock requests must carry evidence.
    #[serde(default)]
    pub require_evidence: bool,
    /// Service protocol version string.
    #[serde(default)]
    pub version: String,
}

/// Per-deposit lease policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasePolicy {
    /// How long each unlocked lease lives, in seconds.
    pub lease_seconds: i64,
}

/// A request to deposit a sealed writer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub escrow_id: String,
    /// Relay the writer key belongs to (hex key).
    pub relay_key: String,
    /// Peer key of the depositing owner.
    pub owner_peer_key: String,
    pub sealed_writer_key: SealedPayload,
    /// Base64 public key the payload was sealed to.
    pub recipient_public_key: String,
    pub policy: LeasePolicy,
}

/// Deposit acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositOutcome {
    pub status: String,
}

/// A request to unlock a deposit into a lease.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub escrow_id: String,
    pub requester_id: String,
    /// Proof the requester is entitled to the key (signed challenge, etc.).
    pub evidence: Value,
}

/// A request to revoke a deposit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub escrow_id: String,
    pub reason: String,
}

/// A lease as the escrow service reports it. The writer key stays sealed on
/// the wire; [`EscrowClient::unlock`] opens it client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLease {
    pub lease_id: String,
    pub escrow_id: String,
    pub relay_key: String,
    pub requester_id: String,
    pub owner_peer_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub evidence: Value,
    pub sealed_writer_key: SealedPayload,
    pub payload_digest: String,
}

impl WireLease {
    /// Open the sealed writer key and build the in-memory lease. The caller
    /// must hand the result to the lease vault immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Sealed`] if the payload does not open with the
    /// given recipient secret.
    pub fn into_lease(self, recipient_secret: &StaticSecret) -> Result<Lease, EscrowError> {
        let key_bytes = open_payload(recipient_secret, &self.sealed_writer_key)?;
        Ok(Lease::with_writer_key(
            self.lease_id,
            self.relay_key,
            self.escrow_id,
            self.requester_id,
            self.owner_peer_key,
            self.issued_at,
            self.expires_at,
            self.evidence,
            WriterKey::from_bytes(key_bytes),
        ))
    }
}

/// A revocation observed on the escrow revocation feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationEvent {
    pub escrow_id: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// Client TLS options for deployments that front escrow with mTLS.
#[derive(Clone, Default)]
pub struct EscrowTlsConfig {
    /// PEM bundle of additional trusted roots.
    pub ca_pem: Option<Vec<u8>>,
    /// PEM client identity (certificate + key).
    pub identity_pem: Option<Vec<u8>>,
    /// Accept invalid certificates. Development only.
    pub accept_invalid_certs: bool,
}

impl std::fmt::Debug for EscrowTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowTlsConfig")
            .field("ca_pem", &self.ca_pem.as_ref().map(|_| "[pem]"))
            .field("identity_pem", &self.identity_pem.as_ref().map(|_| "[REDACTED]"))
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// Escrow client configuration.
#[derive(Clone)]
pub struct EscrowClientConfig {
    /// Base URL of the escrow service, without trailing slash.
    pub base_url: String,
    /// Client id sent in `X-Escrow-Client-Id`.
    pub client_id: String,
    /// HMAC secret shared with the escrow service.
    pub signing_secret: Vec<u8>,
    /// Overall per-call deadline including retries.
    pub deadline: Duration,
    pub tls: EscrowTlsConfig,
}

impl EscrowClientConfig {
    /// Config with the default deadline and no TLS extras.
    #[must_use]
    pub fn new(base_url: String, client_id: String, signing_secret: Vec<u8>) -> Self {
        Self {
            base_url,
            client_id,
            signing_secret,
            deadline: DEFAULT_DEADLINE,
            tls: EscrowTlsConfig::default(),
        }
    }
}

impl std::fmt::Debug for EscrowClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowClientConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("signing_secret", &"[REDACTED]")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Signed REST client for the escrow service.
pub struct EscrowClient {
    http: reqwest::Client,
    config: EscrowClientConfig,
}

impl EscrowClient {
    /// Build a client, applying any TLS material from the config.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Config`] for unusable TLS material or an
    /// unbuildable HTTP client.
    pub fn new(config: EscrowClientConfig) -> Result<Self, EscrowError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.deadline)
            .user_agent(concat!("hypertuna-gateway/", env!("CARGO_PKG_VERSION")));

        if let Some(ca) = &config.tls.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca).map_err(|e| EscrowError::Config {
                reason: format!("bad CA pem: {e}"),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = &config.tls.identity_pem {
            let identity =
                reqwest::Identity::from_pem(identity).map_err(|e| EscrowError::Config {
                    reason: format!("bad client identity pem: {e}"),
                })?;
            builder = builder.identity(identity);
        }
        if config.tls.accept_invalid_certs {
            warn!("escrow client accepting invalid certificates");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().map_err(|e| EscrowError::Config {
            reason: e.to_string(),
        })?;

        Ok(Self { http, config })
    }

    /// `GET /policy` — the service's lease policy.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn fetch_policy(&self) -> Result<EscrowPolicy, EscrowError> {
        let value = self.send(Method::GET, "/policy", None).await?;
        decode("policy", value)
    }

    /// `POST /` — persist a sealed writer key server-side.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn deposit(&self, request: &DepositRequest) -> Result<DepositOutcome, EscrowError> {
        let body = to_body(request)?;
        let value = self.send(Method::POST, "/", Some(&body)).await?;
        decode("deposit response", value)
    }

    /// `POST /unlock` — unlock a deposit into a lease and open the writer
    /// key with the gateway's recipient secret.
    ///
    /// The returned lease carries the raw writer key; pass it into the
    /// lease vault immediately.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn unlock(
        &self,
        request: &UnlockRequest,
        recipient_secret: &StaticSecret,
    ) -> Result<Lease, EscrowError> {
        let body = to_body(request)?;
        let value = self.send(Method::POST, "/unlock", Some(&body)).await?;
        let wire: WireLease = decode("unlock response", value)?;
        wire.into_lease(recipient_secret)
    }

    /// `POST /revoke` — mark a deposit revoked.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn revoke(&self, request: &RevokeRequest) -> Result<(), EscrowError> {
        let body = to_body(request)?;
        self.send(Method::POST, "/revoke", Some(&body)).await?;
        Ok(())
    }

    /// `GET /leases` — the server's view of active leases, for
    /// reconciliation. Writer keys stay sealed.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn list_leases(&self) -> Result<Vec<WireLease>, EscrowError> {
        let value = self.send(Method::GET, "/leases", None).await?;
        decode("lease list", value)
    }

    /// `GET /revocations?since=…` — revocations on or after the given
    /// instant. The renewal worker polls this and releases matching leases.
    ///
    /// # Errors
    ///
    /// See [`EscrowError`].
    pub async fn fetch_revocations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RevocationEvent>, EscrowError> {
        let path = format!("/revocations?since={}", since.timestamp_millis());
        let value = self.send(Method::GET, &path, None).await?;
        decode("revocation list", value)
    }

    /// Send a signed request, retrying transient failures within the
    /// deadline.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, EscrowError> {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut last_transient = String::new();

        loop {
            let signable = body.cloned().unwrap_or_else(|| json!({}));
            let ts_ms = Utc::now().timestamp_millis();
            let signature = sign_request(
                &self.config.signing_secret,
                &self.config.client_id,
                &signable,
                ts_ms,
            );

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(HEADER_CLIENT_ID, &self.config.client_id)
                .header(HEADER_TIMESTAMP, ts_ms.to_string())
                .header(HEADER_SIGNATURE, signature);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let parsed: Value = if text.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_str(&text).unwrap_or(Value::String(text))
                    };

                    if status.is_success() {
                        return Ok(parsed);
                    }
                    if !status.is_server_error() {
                        return Err(EscrowError::Api {
                            status: status.as_u16(),
                            body: parsed,
                        });
                    }
                    last_transient = format!("server error {status}");
                    debug!(url = %url, status = %status, attempt, "escrow 5xx, will retry");
                }
                Err(e) => {
                    last_transient = e.to_string();
                    debug!(url = %url, error = %e, attempt, "escrow transport error, will retry");
                }
            }

            let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
            attempt = attempt.saturating_add(1);
            if started.elapsed() + backoff >= self.config.deadline {
                if last_transient.is_empty() {
                    return Err(EscrowError::DeadlineExceeded {
                        deadline_ms: self.config.deadline.as_millis() as u64,
                    });
                }
                return Err(EscrowError::Transport {
                    reason: last_transient,
                });
            }
            tokio::time::sleep(backoff).await;
        }
    }
}

impl std::fmt::Debug for EscrowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowClient")
            .field("base_url", &self.config.base_url)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, EscrowError> {
    serde_json::to_value(value).map_err(|e| EscrowError::Decode {
        reason: format!("request encode failed: {e}"),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(what: &str, value: Value) -> Result<T, EscrowError> {
    serde_json::from_value(value).map_err(|e| EscrowError::Decode {
        reason: format!("{what}: {e}"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sealed::{generate_recipient_keypair, seal_payload};
    use crate::signing::{verify_request_at, DEFAULT_TOLERANCE_MS};

    #[test]
    fn wire_lease_opens_into_vault_lease() {
        let (secret, public) = generate_recipient_keypair();
        let sealed = seal_payload(&public, &[0x11; 32]).unwrap();

        let wire = WireLease {
            lease_id: "l-1".to_owned(),
            escrow_id: "e-1".to_owned(),
            relay_key: hex::encode([2u8; 32]),
            requester_id: "gw-1".to_owned(),
            owner_peer_key: "peer-owner".to_owned(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
            evidence: json!({"challenge": "ok"}),
            sealed_writer_key: sealed,
            payload_digest: String::new(),
        };

        let lease = wire.into_lease(&secret).unwrap();
        let key = lease.writer_package.writer_key.as_ref().unwrap();
        assert_eq!(key.as_bytes(), &[0x11; 32]);
        // Digest is recomputed from the opened key and the relay key.
        assert_eq!(lease.payload_digest.len(), 64);
    }

    #[test]
    fn wire_lease_with_wrong_recipient_fails() {
        let (_, public) = generate_recipient_keypair();
        let (wrong_secret, _) = generate_recipient_keypair();
        let sealed = seal_payload(&public, &[0x11; 32]).unwrap();

        let wire = WireLease {
            lease_id: "l-1".to_owned(),
            escrow_id: "e-1".to_owned(),
            relay_key: hex::encode([2u8; 32]),
            requester_id: "gw-1".to_owned(),
            owner_peer_key: "peer-owner".to_owned(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
            evidence: Value::Null,
            sealed_writer_key: sealed,
            payload_digest: String::new(),
        };

        assert!(matches!(
            wire.into_lease(&wrong_secret),
            Err(EscrowError::Sealed(_))
        ));
    }

    #[test]
    fn request_signature_verifies_like_the_service_would() {
        let secret = b"escrow-shared";
        let body = json!({"escrowId": "e-1", "requesterId": "gw-1"});
        let ts = Utc::now().timestamp_millis();
        let sig = sign_request(secret, "gateway-client", &body, ts);
        verify_request_at(secret, "gateway-client", &body, ts, &sig, DEFAULT_TOLERANCE_MS, ts)
            .unwrap();
    }

    #[test]
    fn wire_lease_serde_uses_camel_case() {
        let (_, public) = generate_recipient_keypair();
        let sealed = seal_payload(&public, b"k").unwrap();
        let wire = WireLease {
            lease_id: "l-1".to_owned(),
            escrow_id: "e-1".to_owned(),
            relay_key: "00".repeat(32),
            requester_id: "gw-1".to_owned(),
            owner_peer_key: "peer".to_owned(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
            evidence: Value::Null,
            sealed_writer_key: sealed,
            payload_digest: "d".to_owned(),
        };
        let encoded = serde_json::to_value(&wire).unwrap();
        assert!(encoded.get("leaseId").is_some());
        assert!(encoded.get("sealedWriterKey").is_some());
        assert!(encoded["sealedWriterKey"].get("senderPublicKey").is_some());
    }
}
