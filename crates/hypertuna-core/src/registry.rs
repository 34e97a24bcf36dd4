//! Relay registry — maps relay identifiers to the worker peers hosting them.
//!
//! Worker peers register the relays they host with an HMAC proof of
//! possession; public clients resolve a relay identifier (raw 64-hex relay
//! key or `"{npub}:{name}"`) to the set of peers with a fresh heartbeat. A
//! relay with no live peer resolves to `NoLivePeer` so the edge can answer
//! with a typed NOTICE instead of a dead tunnel.
//!
//! Reads take a shared lock and copy snapshots out; writes serialize.
//! Relay records persist through the key-value store so registrations
//! survive a gateway restart; peer liveness is runtime-only and rebuilt
//! from heartbeats.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use hypertuna_storage::StorageBackend;

use crate::error::RegistryError;
use crate::signing::{verify_request, DEFAULT_TOLERANCE_MS};

/// Storage prefix for persisted relay records.
const RELAY_PREFIX: &str = "registry/relays/";

/// Per-relay policy knobs, adjustable by admins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPolicy {
    /// Whether unauthenticated clients may open read subscriptions.
    pub open_reads: bool,
    /// Whether publishes are accepted through the gateway.
    pub open_writes: bool,
    /// Maximum concurrent subscriptions per tunnel.
    pub max_subscriptions: u32,
    /// Maximum accepted frame size in bytes.
    pub max_frame_bytes: u64,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            open_reads: true,
            open_writes: true,
            max_subscriptions: 32,
            max_frame_bytes: 512 * 1024,
        }
    }
}

/// Partial policy update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPolicyPatch {
    pub open_reads: Option<bool>,
    pub open_writes: Option<bool>,
    pub max_subscriptions: Option<u32>,
    pub max_frame_bytes: Option<u64>,
}

impl RelayPolicyPatch {
    fn apply(&self, policy: &mut RelayPolicy) {
        if let Some(v) = self.open_reads {
            policy.open_reads = v;
        }
        if let Some(v) = self.open_writes {
            policy.open_writes = v;
        }
        if let Some(v) = self.max_subscriptions {
            policy.max_subscriptions = v;
        }
        if let Some(v) = self.max_frame_bytes {
            policy.max_frame_bytes = v;
        }
    }
}

/// A registered relay and the peers bound to it. Persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord {
    pub id: String,
    pub owner_pubkey: String,
    pub name: String,
    /// Hex-encoded 32-byte relay public key; the primary identifier.
    pub relay_key: String,
    pub policy: RelayPolicy,
    pub created_at: DateTime<Utc>,
    /// Peer ids currently bound to this relay.
    pub peers: Vec<String>,
}

/// Runtime view of a worker peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    /// Dial address for the internal framed channel (`host:port`).
    pub endpoint: String,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// HMAC proof that the registering peer possesses the shared secret.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    pub ts_ms: i64,
    pub signature: String,
}

/// A relay registration request from a worker peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub relay_key: String,
    pub owner_pubkey: String,
    pub name: String,
    pub peer_id: String,
    pub peer_endpoint: String,
    pub auth_proof: AuthProof,
}

/// Returned to a successfully registered peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub relay_id: String,
    /// The co-located mirror's public key, for the worker to allow.
    pub mirror_public_key: String,
    /// Topic the worker should replicate its cores on.
    pub replication_topic: String,
}

/// Result of resolving a relay identifier.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub relay: RelayRecord,
    /// Peers with a heartbeat fresher than the staleness window.
    pub peers: Vec<PeerInfo>,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Heartbeats older than this make a peer stale.
    pub peer_staleness_secs: i64,
    /// Shared secret worker peers sign registration proofs with.
    pub registration_secret: Vec<u8>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer_staleness_secs: 90,
            registration_secret: Vec::new(),
        }
    }
}

/// Identity the registry hands to registering peers once the mirror is up.
#[derive(Debug, Clone, Default)]
pub struct MirrorIdentity {
    pub public_key: String,
    pub replication_topic: String,
}

#[derive(Default)]
struct Inner {
    relays: HashMap<String, RelayRecord>,
    /// `(owner_pubkey, name)` → relay key.
    by_owner_name: HashMap<(String, String), String>,
    peers: HashMap<String, PeerRuntime>,
    mirror: MirrorIdentity,
}

#[derive(Debug, Clone)]
struct PeerRuntime {
    endpoint: String,
    last_heartbeat_at: DateTime<Utc>,
    relays: HashSet<String>,
}

/// Owns relay and peer records.
pub struct RelayRegistry {
    config: RegistryConfig,
    storage: Arc<dyn StorageBackend>,
    inner: tokio::sync::RwLock<Inner>,
}

impl RelayRegistry {
    /// Create a registry backed by the given key-value store.
    #[must_use]
    pub fn new(config: RegistryConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            storage,
            inner: tokio::sync::RwLock::new(Inner::default()),
        }
    }

    /// Load persisted relay records into memory. Called once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if listing or reading fails.
    pub async fn load(&self) -> Result<usize, RegistryError> {
        let keys = self.storage.list(RELAY_PREFIX).await?;
        let mut loaded = 0usize;
        let mut inner = self.inner.write().await;
        for key in keys {
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            let record: RelayRecord =
                serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
                    reason: format!("relay record at '{key}': {e}"),
                })?;
            inner
                .by_owner_name
                .insert((record.owner_pubkey.clone(), record.name.clone()), record.relay_key.clone());
            inner.relays.insert(record.relay_key.clone(), record);
            loaded += 1;
        }
        info!(loaded, "relay registry loaded");
        Ok(loaded)
    }

    /// Record the mirror identity handed out in registration responses.
    pub async fn set_mirror_identity(&self, identity: MirrorIdentity) {
        let mut inner = self.inner.write().await;
        inner.mirror = identity;
    }

    /// Register a relay (or bind an additional peer to an existing one).
    ///
    /// The peer's proof of possession is an HMAC over the canonical
    /// registration payload with the shared registration secret.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidProof`] when the HMAC does not verify.
    /// - [`RegistryError::InvalidIdentifier`] for a malformed relay key.
    /// - [`RegistryError::Storage`] if persisting fails.
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegistrationResponse, RegistryError> {
        if !is_hex_key(&request.relay_key) {
            return Err(RegistryError::InvalidIdentifier {
                identifier: request.relay_key,
            });
        }

        let body = json!({
            "relayKey": request.relay_key,
            "ownerPubkey": request.owner_pubkey,
            "name": request.name,
            "peerId": request.peer_id,
            "peerEndpoint": request.peer_endpoint,
        });
        verify_request(
            &self.config.registration_secret,
            &request.peer_id,
            &body,
            request.auth_proof.ts_ms,
            &request.auth_proof.signature,
            DEFAULT_TOLERANCE_MS,
        )?;

        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let record = inner
            .relays
            .entry(request.relay_key.clone())
            .or_insert_with(|| RelayRecord {
                id: uuid::Uuid::new_v4().to_string(),
                owner_pubkey: request.owner_pubkey.clone(),
                name: request.name.clone(),
                relay_key: request.relay_key.clone(),
                policy: RelayPolicy::default(),
                created_at: now,
                peers: Vec::new(),
            });
        if !record.peers.contains(&request.peer_id) {
            record.peers.push(request.peer_id.clone());
        }
        let record = record.clone();

        inner.by_owner_name.insert(
            (request.owner_pubkey.clone(), request.name.clone()),
            request.relay_key.clone(),
        );

        let peer = inner
            .peers
            .entry(request.peer_id.clone())
            .or_insert_with(|| PeerRuntime {
                endpoint: request.peer_endpoint.clone(),
                last_heartbeat_at: now,
                relays: HashSet::new(),
            });
        peer.endpoint = request.peer_endpoint.clone();
        peer.last_heartbeat_at = now;
        peer.relays.insert(request.relay_key.clone());

        let response = RegistrationResponse {
            relay_id: record.id.clone(),
            mirror_public_key: inner.mirror.public_key.clone(),
            replication_topic: inner.mirror.replication_topic.clone(),
        };
        drop(inner);

        self.persist(&record).await?;
        info!(relay_key = %record.relay_key, peer_id = %request.peer_id, "relay registered");

        Ok(response)
    }

    /// Unbind a peer from a relay. Idempotent. When the last peer leaves,
    /// the relay record itself is removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if persisting fails.
    pub async fn deregister(&self, relay_key: &str, peer_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.relays.remove(relay_key);
        }

        let Some(record) = inner.relays.get_mut(relay_key) else {
            return Ok(());
        };
        record.peers.retain(|p| p != peer_id);

        if record.peers.is_empty() {
            let owner_key = (record.owner_pubkey.clone(), record.name.clone());
            inner.relays.remove(relay_key);
            inner.by_owner_name.remove(&owner_key);
            drop(inner);
            self.storage
                .delete(&format!("{RELAY_PREFIX}{relay_key}"))
                .await?;
            info!(relay_key = %relay_key, "relay deregistered");
        } else {
            let record = record.clone();
            drop(inner);
            self.persist(&record).await?;
            debug!(relay_key = %relay_key, peer_id = %peer_id, "peer unbound from relay");
        }
        Ok(())
    }

    /// Resolve a relay identifier to its record and live peers.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidIdentifier`] for a malformed identifier.
    /// - [`RegistryError::UnknownRelay`] when nothing is registered.
    /// - [`RegistryError::NoLivePeer`] when no bound peer is fresh.
    pub async fn resolve(&self, identifier: &str) -> Result<Resolved, RegistryError> {
        let inner = self.inner.read().await;

        let relay_key = if is_hex_key(identifier) {
            identifier.to_owned()
        } else if let Some((owner, name)) = identifier.split_once(':') {
            inner
                .by_owner_name
                .get(&(owner.to_owned(), name.to_owned()))
                .cloned()
                .ok_or_else(|| RegistryError::UnknownRelay {
                    identifier: identifier.to_owned(),
                })?
        } else {
            return Err(RegistryError::InvalidIdentifier {
                identifier: identifier.to_owned(),
            });
        };

        let relay = inner
            .relays
            .get(&relay_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownRelay {
                identifier: identifier.to_owned(),
            })?;

        let horizon = Utc::now() - Duration::seconds(self.config.peer_staleness_secs);
        let peers: Vec<PeerInfo> = relay
            .peers
            .iter()
            .filter_map(|peer_id| {
                let runtime = inner.peers.get(peer_id)?;
                (runtime.last_heartbeat_at >= horizon).then(|| PeerInfo {
                    peer_id: peer_id.clone(),
                    endpoint: runtime.endpoint.clone(),
                    last_heartbeat_at: runtime.last_heartbeat_at,
                })
            })
            .collect();

        if peers.is_empty() {
            return Err(RegistryError::NoLivePeer {
                identifier: identifier.to_owned(),
            });
        }

        Ok(Resolved { relay, peers })
    }

    /// Apply an admin policy patch to a relay.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownRelay`] when nothing is registered.
    /// - [`RegistryError::Storage`] if persisting fails.
    pub async fn update_policy(
        &self,
        relay_key: &str,
        patch: &RelayPolicyPatch,
    ) -> Result<RelayPolicy, RegistryError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .relays
            .get_mut(relay_key)
            .ok_or_else(|| RegistryError::UnknownRelay {
                identifier: relay_key.to_owned(),
            })?;
        patch.apply(&mut record.policy);
        let record = record.clone();
        drop(inner);

        self.persist(&record).await?;
        Ok(record.policy)
    }

    /// Record a heartbeat for a peer, refreshing its endpoint if it moved.
    ///
    /// Returns `false` for a peer that has never registered a relay.
    pub async fn record_heartbeat(&self, peer_id: &str, endpoint: Option<&str>) -> bool {
        let mut inner = self.inner.write().await;
        let Some(peer) = inner.peers.get_mut(peer_id) else {
            return false;
        };
        peer.last_heartbeat_at = Utc::now();
        if let Some(endpoint) = endpoint {
            peer.endpoint = endpoint.to_owned();
        }
        true
    }

    /// Drop peers whose last heartbeat is older than the staleness window.
    ///
    /// Relay bindings survive — a peer that comes back and heartbeats again
    /// becomes live without re-registering.
    pub async fn eject_stale_peers(&self) -> Vec<String> {
        let horizon = Utc::now() - Duration::seconds(self.config.peer_staleness_secs);
        let mut inner = self.inner.write().await;
        let stale: Vec<String> = inner
            .peers
            .iter()
            .filter(|(_, p)| p.last_heartbeat_at < horizon)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in &stale {
            inner.peers.remove(peer_id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "stale peers ejected");
        }
        stale
    }

    /// Count of currently live peers.
    pub async fn live_peer_count(&self) -> usize {
        let horizon = Utc::now() - Duration::seconds(self.config.peer_staleness_secs);
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter(|p| p.last_heartbeat_at >= horizon)
            .count()
    }

    async fn persist(&self, record: &RelayRecord) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec(record).map_err(|e| RegistryError::Corrupt {
            reason: format!("relay record encode failed: {e}"),
        })?;
        self.storage
            .put(&format!("{RELAY_PREFIX}{}", record.relay_key), &bytes)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RelayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRegistry")
            .field("staleness_secs", &self.config.peer_staleness_secs)
            .finish_non_exhaustive()
    }
}

/// A 64-char lowercase/uppercase hex string (32-byte key).
fn is_hex_key(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signing::sign_request;
    use hypertuna_storage::MemoryBackend;

    const SECRET: &[u8] = b"registration-secret";

    fn registry() -> RelayRegistry {
        RelayRegistry::new(
            RegistryConfig {
                peer_staleness_secs: 90,
                registration_secret: SECRET.to_vec(),
            },
            Arc::new(MemoryBackend::new()),
        )
    }

    fn relay_key(n: u8) -> String {
        hex::encode([n; 32])
    }

    fn signed_request(relay_key: &str, peer_id: &str) -> RegisterRequest {
        let ts = Utc::now().timestamp_millis();
        let body = json!({
            "relayKey": relay_key,
            "ownerPubkey": "npub1owner",
            "name": "chat",
            "peerId": peer_id,
            "peerEndpoint": "10.0.0.1:9400",
        });
        let signature = sign_request(SECRET, peer_id, &body, ts);
        RegisterRequest {
            relay_key: relay_key.to_owned(),
            owner_pubkey: "npub1owner".to_owned(),
            name: "chat".to_owned(),
            peer_id: peer_id.to_owned(),
            peer_endpoint: "10.0.0.1:9400".to_owned(),
            auth_proof: AuthProof {
                ts_ms: ts,
                signature,
            },
        }
    }

    #[tokio::test]
    async fn register_then_resolve_by_key_and_by_owner_name() {
        let registry = registry();
        let key = relay_key(1);
        registry.register(signed_request(&key, "peer-1")).await.unwrap();

        let by_key = registry.resolve(&key).await.unwrap();
        assert_eq!(by_key.relay.name, "chat");
        assert_eq!(by_key.peers.len(), 1);
        assert_eq!(by_key.peers[0].endpoint, "10.0.0.1:9400");

        let by_name = registry.resolve("npub1owner:chat").await.unwrap();
        assert_eq!(by_name.relay.relay_key, key);
    }

    #[tokio::test]
    async fn register_rejects_bad_proof() {
        let registry = registry();
        let key = relay_key(1);
        let mut request = signed_request(&key, "peer-1");
        request.auth_proof.signature = "00".repeat(32);
        let err = registry.register(request).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidProof(_)));
    }

    #[tokio::test]
    async fn register_rejects_malformed_relay_key() {
        let registry = registry();
        let request = signed_request("not-a-key", "peer-1");
        let err = registry.register(request).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn resolve_unknown_relay_errors() {
        let registry = registry();
        let err = registry.resolve(&relay_key(9)).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRelay { .. }));
    }

    #[tokio::test]
    async fn resolve_malformed_identifier_errors() {
        let registry = registry();
        let err = registry.resolve("definitely wrong").await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn stale_peer_makes_relay_unresolvable() {
        let registry = RelayRegistry::new(
            RegistryConfig {
                // Everything is immediately stale.
                peer_staleness_secs: 0,
                registration_secret: SECRET.to_vec(),
            },
            Arc::new(MemoryBackend::new()),
        );
        let key = relay_key(1);
        registry.register(signed_request(&key, "peer-1")).await.unwrap();

        // The registration heartbeat is already older than the zero window.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let err = registry.resolve(&key).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoLivePeer { .. }));
    }

    #[tokio::test]
    async fn deregister_is_idempotent_and_removes_empty_relay() {
        let registry = registry();
        let key = relay_key(1);
        registry.register(signed_request(&key, "peer-1")).await.unwrap();

        registry.deregister(&key, "peer-1").await.unwrap();
        registry.deregister(&key, "peer-1").await.unwrap();

        let err = registry.resolve(&key).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRelay { .. }));
    }

    #[tokio::test]
    async fn multiple_peers_survive_single_deregister() {
        let registry = registry();
        let key = relay_key(1);
        registry.register(signed_request(&key, "peer-1")).await.unwrap();
        registry.register(signed_request(&key, "peer-2")).await.unwrap();

        registry.deregister(&key, "peer-1").await.unwrap();
        let resolved = registry.resolve(&key).await.unwrap();
        assert_eq!(resolved.peers.len(), 1);
        assert_eq!(resolved.peers[0].peer_id, "peer-2");
    }

    #[tokio::test]
    async fn policy_patch_applies_partially() {
        let registry = registry();
        let key = relay_key(1);
        registry.register(signed_request(&key, "peer-1")).await.unwrap();

        let policy = registry
            .update_policy(
                &key,
                &RelayPolicyPatch {
                    open_writes: Some(false),
                    ..RelayPolicyPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(!policy.open_writes);
        assert!(policy.open_reads);
    }

    #[tokio::test]
    async fn heartbeat_unknown_peer_is_rejected() {
        let registry = registry();
        assert!(!registry.record_heartbeat("ghost", None).await);
    }

    #[tokio::test]
    async fn load_restores_persisted_relays() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let key = relay_key(1);
        {
            let registry = RelayRegistry::new(
                RegistryConfig {
                    peer_staleness_secs: 90,
                    registration_secret: SECRET.to_vec(),
                },
                Arc::clone(&storage),
            );
            registry.register(signed_request(&key, "peer-1")).await.unwrap();
        }

        let registry = RelayRegistry::new(
            RegistryConfig {
                peer_staleness_secs: 90,
                registration_secret: SECRET.to_vec(),
            },
            storage,
        );
        assert_eq!(registry.load().await.unwrap(), 1);

        // Relay record is back, but no peer has heartbeated yet.
        let err = registry.resolve(&key).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoLivePeer { .. }));
    }
}
