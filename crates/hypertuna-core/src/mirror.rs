//! Blind-peer mirror — co-located replication of worker cores.
//!
//! The gateway hosts a blind peer that follows append-only cores published
//! by trusted worker peers, so relay data survives individual worker churn.
//! The mirror is deliberately content-blind: it records which cores it
//! follows and how many bytes they take, never what is inside them.
//!
//! Initialization failures are fatal for this subsystem but never for the
//! gateway — when disabled or stopped, operations answer
//! [`MirrorOutcome::Inactive`] instead of erroring. The trusted-peer
//! allowlist lives in a JSON file on disk and survives restarts; the
//! follow-set is persisted through the key-value store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use hypertuna_storage::StorageBackend;

use crate::crypto::sha256_hex;
use crate::error::MirrorError;
use crate::telemetry::TelemetrySink;

/// Storage prefix for followed-core records.
const CORE_PREFIX: &str = "mirror/cores/";

/// Storage key for the mirror's stable identity keys.
const IDENTITY_KEY: &str = "mirror/identity";

/// An entry in the trusted-peer allowlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    /// Hex public key of the trusted writer.
    pub key: String,
    pub trusted_since: DateTime<Utc>,
}

/// Mirror configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub enabled: bool,
    /// Directory the embedded store node keeps its data in.
    pub storage_dir: PathBuf,
    /// JSON file holding the trusted-peer allowlist.
    pub trusted_peers_persist_path: PathBuf,
}

/// Options for a mirror request.
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Announce the core on the replication swarm.
    pub announce: bool,
    /// Download priority relative to other followed cores.
    pub priority: u8,
    /// Which peer or subsystem asked for the mirror.
    pub referrer: Option<String>,
}

/// Result of a mirror request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The core is now followed.
    Accepted { core_key: String },
    /// The core was already followed; the request was a no-op.
    Duplicate { core_key: String },
    /// The mirror is disabled or stopped.
    Inactive,
}

/// Public identity of the running mirror, shared with registering workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorIdentityKeys {
    pub public_key: String,
    pub encryption_key: String,
}

/// Snapshot served on `GET /api/blind-peer`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStatus {
    pub enabled: bool,
    pub running: bool,
    pub trusted_peer_count: usize,
    pub storage_dir: String,
    /// Digest over the sorted allowlist, for change detection.
    pub digest: String,
    pub public_key: String,
    pub encryption_key: String,
    pub trusted_peers: Vec<TrustedPeer>,
    pub cores_followed: usize,
    pub bytes_allocated: u64,
}

#[derive(Default)]
struct MirrorState {
    initialized: bool,
    running: bool,
    trusted: Vec<TrustedPeer>,
    cores: HashSet<String>,
    identity: Option<MirrorIdentityKeys>,
    bytes_allocated: u64,
}

/// Wraps the co-hosted content-addressed store node.
pub struct BlindPeerMirror {
    config: MirrorConfig,
    storage: Arc<dyn StorageBackend>,
    telemetry: Arc<dyn TelemetrySink>,
    state: tokio::sync::Mutex<MirrorState>,
}

impl BlindPeerMirror {
    /// Create a mirror. Call [`initialize`](Self::initialize) before
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: MirrorConfig,
        storage: Arc<dyn StorageBackend>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            storage,
            telemetry,
            state: tokio::sync::Mutex::new(MirrorState::default()),
        }
    }

    /// Load the trusted-peer allowlist and prepare the storage directory.
    ///
    /// A missing allowlist file means an empty allowlist, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Init`] when the allowlist is unreadable or the
    /// storage directory cannot be created. Fatal for the subsystem only.
    pub async fn initialize(&self) -> Result<(), MirrorError> {
        if !self.config.enabled {
            info!("blind-peer mirror disabled");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.storage_dir)
            .await
            .map_err(|e| MirrorError::Init {
                reason: format!(
                    "storage dir '{}': {e}",
                    self.config.storage_dir.display()
                ),
            })?;

        let trusted = match tokio::fs::read(&self.config.trusted_peers_persist_path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<TrustedPeer>>(&bytes).map_err(|e| {
                MirrorError::Init {
                    reason: format!("allowlist parse failed: {e}"),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(MirrorError::Init {
                    reason: format!(
                        "allowlist '{}': {e}",
                        self.config.trusted_peers_persist_path.display()
                    ),
                })
            }
        };

        let mut state = self.state.lock().await;
        state.trusted = trusted;
        state.initialized = true;
        info!(
            trusted_peers = state.trusted.len(),
            storage_dir = %self.config.storage_dir.display(),
            "blind-peer mirror initialized"
        );
        Ok(())
    }

    /// Boot the embedded store node, restoring identity and the follow-set.
    ///
    /// Returns `None` when the mirror is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Storage`] if identity or core records cannot
    /// be read or written.
    pub async fn start(&self) -> Result<Option<MirrorIdentityKeys>, MirrorError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let identity = match self.storage.get(IDENTITY_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| MirrorError::Init {
                reason: format!("identity record corrupt: {e}"),
            })?,
            None => {
                let identity = MirrorIdentityKeys {
                    public_key: random_key_hex(),
                    encryption_key: random_key_hex(),
                };
                let bytes = serde_json::to_vec(&identity).map_err(|e| MirrorError::Init {
                    reason: format!("identity encode failed: {e}"),
                })?;
                self.storage.put(IDENTITY_KEY, &bytes).await?;
                identity
            }
        };

        let mut cores = HashSet::new();
        for key in self.storage.list(CORE_PREFIX).await? {
            if let Some(core_key) = key.strip_prefix(CORE_PREFIX) {
                cores.insert(core_key.to_owned());
            }
        }

        let mut state = self.state.lock().await;
        state.identity = Some(identity.clone());
        state.cores = cores;
        state.running = true;
        self.telemetry.set_gauge("mirror_active", 1.0);
        self.telemetry
            .set_gauge("mirror_trusted_peers", state.trusted.len() as f64);
        info!(
            cores = state.cores.len(),
            public_key = %identity.public_key,
            "blind-peer mirror started"
        );
        Ok(Some(identity))
    }

    /// Stop the node. Follow-set and allowlist stay persisted.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            state.running = false;
            self.telemetry.set_gauge("mirror_active", 0.0);
            info!("blind-peer mirror stopped");
        }
    }

    /// Ask the node to follow a remote core. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Storage`] if persisting the record fails.
    pub async fn mirror_core(
        &self,
        core_key: &str,
        options: &MirrorOptions,
    ) -> Result<MirrorOutcome, MirrorError> {
        self.mirror_entry("core", core_key, None, options).await
    }

    /// Ask the node to follow a multi-writer log and its target view.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Storage`] if persisting the record fails.
    pub async fn mirror_autobase(
        &self,
        autobase_key: &str,
        target: Option<&str>,
        options: &MirrorOptions,
    ) -> Result<MirrorOutcome, MirrorError> {
        self.mirror_entry("autobase", autobase_key, target, options)
            .await
    }

    /// Add a key to the allowlist, persist it, and push it into the running
    /// node.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Persist`] if the allowlist cannot be written.
    pub async fn add_trusted_peer(&self, key: &str) -> Result<(), MirrorError> {
        let mut state = self.state.lock().await;
        if state.trusted.iter().any(|p| p.key == key) {
            return Ok(());
        }
        state.trusted.push(TrustedPeer {
            key: key.to_owned(),
            trusted_since: Utc::now(),
        });
        let snapshot = state.trusted.clone();
        let count = snapshot.len();
        drop(state);

        self.persist_allowlist(&snapshot).await?;
        self.telemetry.set_gauge("mirror_trusted_peers", count as f64);
        info!(key = %key, "trusted peer added");
        Ok(())
    }

    /// Remove a key from the allowlist and persist the change.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Persist`] if the allowlist cannot be written.
    pub async fn remove_trusted_peer(&self, key: &str) -> Result<(), MirrorError> {
        let mut state = self.state.lock().await;
        let before = state.trusted.len();
        state.trusted.retain(|p| p.key != key);
        if state.trusted.len() == before {
            return Ok(());
        }
        let snapshot = state.trusted.clone();
        let count = snapshot.len();
        drop(state);

        self.persist_allowlist(&snapshot).await?;
        self.telemetry.set_gauge("mirror_trusted_peers", count as f64);
        info!(key = %key, "trusted peer removed");
        Ok(())
    }

    /// Current subsystem status.
    pub async fn status(&self) -> MirrorStatus {
        let state = self.state.lock().await;
        let mut keys: Vec<&str> = state.trusted.iter().map(|p| p.key.as_str()).collect();
        keys.sort_unstable();
        let digest = sha256_hex(keys.join(",").as_bytes());
        let (public_key, encryption_key) = state
            .identity
            .as_ref()
            .map(|i| (i.public_key.clone(), i.encryption_key.clone()))
            .unwrap_or_default();

        MirrorStatus {
            enabled: self.config.enabled,
            running: state.running,
            trusted_peer_count: state.trusted.len(),
            storage_dir: self.config.storage_dir.display().to_string(),
            digest,
            public_key,
            encryption_key,
            trusted_peers: state.trusted.clone(),
            cores_followed: state.cores.len(),
            bytes_allocated: state.bytes_allocated,
        }
    }

    async fn mirror_entry(
        &self,
        kind: &str,
        core_key: &str,
        target: Option<&str>,
        options: &MirrorOptions,
    ) -> Result<MirrorOutcome, MirrorError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(MirrorOutcome::Inactive);
        }
        if state.cores.contains(core_key) {
            return Ok(MirrorOutcome::Duplicate {
                core_key: core_key.to_owned(),
            });
        }

        let record = json!({
            "kind": kind,
            "coreKey": core_key,
            "target": target,
            "announce": options.announce,
            "priority": options.priority,
            "referrer": options.referrer,
            "followedAt": Utc::now(),
        });
        let bytes = serde_json::to_vec(&record).map_err(|e| MirrorError::Init {
            reason: format!("core record encode failed: {e}"),
        })?;
        self.storage
            .put(&format!("{CORE_PREFIX}{core_key}"), &bytes)
            .await?;

        state.cores.insert(core_key.to_owned());
        // Record bookkeeping only; actual block storage is the node's concern.
        state.bytes_allocated = state.bytes_allocated.saturating_add(bytes.len() as u64);
        self.telemetry.incr_counter("mirror_cores_followed", 1);
        self.telemetry
            .incr_counter("mirror_bytes_allocated", bytes.len() as u64);

        info!(kind = %kind, core_key = %core_key, announce = options.announce, "core mirrored");
        Ok(MirrorOutcome::Accepted {
            core_key: core_key.to_owned(),
        })
    }

    async fn persist_allowlist(&self, trusted: &[TrustedPeer]) -> Result<(), MirrorError> {
        let path = &self.config.trusted_peers_persist_path;
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "allowlist parent dir creation failed");
            }
        }
        let bytes = serde_json::to_vec_pretty(trusted).map_err(|e| MirrorError::Persist {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| MirrorError::Persist {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for BlindPeerMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlindPeerMirror")
            .field("enabled", &self.config.enabled)
            .finish_non_exhaustive()
    }
}

/// 32 bytes of OS CSPRNG randomness, hex-encoded.
///
/// Two UUID v4s carry 122 random bits each; concatenating their byte forms
/// gives a 32-byte identity key without pulling in a direct RNG dependency.
fn random_key_hex() -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(a.as_bytes());
    bytes.extend_from_slice(b.as_bytes());
    hex::encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::telemetry::NullTelemetry;
    use hypertuna_storage::MemoryBackend;

    fn mirror_in(dir: &std::path::Path, enabled: bool) -> BlindPeerMirror {
        BlindPeerMirror::new(
            MirrorConfig {
                enabled,
                storage_dir: dir.join("blind-peer"),
                trusted_peers_persist_path: dir.join("trusted-peers.json"),
            },
            Arc::new(MemoryBackend::new()),
            Arc::new(NullTelemetry),
        )
    }

    #[tokio::test]
    async fn disabled_mirror_reports_inactive() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(tmp.path(), false);
        mirror.initialize().await.unwrap();
        assert!(mirror.start().await.unwrap().is_none());

        let outcome = mirror
            .mirror_core(&"ab".repeat(32), &MirrorOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, MirrorOutcome::Inactive);

        let status = mirror.status().await;
        assert!(!status.enabled);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn mirror_core_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(tmp.path(), true);
        mirror.initialize().await.unwrap();
        mirror.start().await.unwrap();

        let key = "cd".repeat(32);
        let first = mirror
            .mirror_core(&key, &MirrorOptions::default())
            .await
            .unwrap();
        assert!(matches!(first, MirrorOutcome::Accepted { .. }));

        let second = mirror
            .mirror_core(&key, &MirrorOptions::default())
            .await
            .unwrap();
        assert!(matches!(second, MirrorOutcome::Duplicate { .. }));

        assert_eq!(mirror.status().await.cores_followed, 1);
    }

    #[tokio::test]
    async fn allowlist_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mirror = mirror_in(tmp.path(), true);
            mirror.initialize().await.unwrap();
            mirror.add_trusted_peer(&"ee".repeat(32)).await.unwrap();
        }

        let mirror = mirror_in(tmp.path(), true);
        mirror.initialize().await.unwrap();
        let status = mirror.status().await;
        assert_eq!(status.trusted_peer_count, 1);
        assert_eq!(status.trusted_peers[0].key, "ee".repeat(32));
    }

    #[tokio::test]
    async fn remove_trusted_peer_updates_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(tmp.path(), true);
        mirror.initialize().await.unwrap();
        mirror.add_trusted_peer("peer-one").await.unwrap();
        let digest_before = mirror.status().await.digest;

        mirror.remove_trusted_peer("peer-one").await.unwrap();
        let status = mirror.status().await;
        assert_eq!(status.trusted_peer_count, 0);
        assert_ne!(status.digest, digest_before);
    }

    #[tokio::test]
    async fn identity_is_stable_across_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let config = MirrorConfig {
            enabled: true,
            storage_dir: tmp.path().join("blind-peer"),
            trusted_peers_persist_path: tmp.path().join("trusted-peers.json"),
        };

        let first = {
            let mirror = BlindPeerMirror::new(
                config.clone(),
                Arc::clone(&storage),
                Arc::new(NullTelemetry),
            );
            mirror.initialize().await.unwrap();
            mirror.start().await.unwrap().unwrap()
        };

        let mirror = BlindPeerMirror::new(config, storage, Arc::new(NullTelemetry));
        mirror.initialize().await.unwrap();
        let second = mirror.start().await.unwrap().unwrap();
        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.encryption_key, second.encryption_key);
    }

    #[tokio::test]
    async fn stopped_mirror_answers_inactive() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = mirror_in(tmp.path(), true);
        mirror.initialize().await.unwrap();
        mirror.start().await.unwrap();
        mirror.stop().await;

        let outcome = mirror
            .mirror_autobase(&"ab".repeat(32), Some("view"), &MirrorOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, MirrorOutcome::Inactive);
    }
}
