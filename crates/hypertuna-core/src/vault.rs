//! Lease vault — the only owner of decrypted writer-key bytes.
//!
//! The escrow client unlocks a lease and immediately hands it to the vault;
//! from then on every copy that leaves the vault is stripped of the secret
//! unless the caller explicitly opts in. At most one lease is active per
//! relay key: tracking a replacement zeroizes the previous secret before the
//! new lease becomes visible, under a single lock so readers never observe
//! the intermediate state.
//!
//! Process-signal handling lives in the binary, not here — the binary calls
//! [`LeaseVault::destroy`] during shutdown, which wipes everything and
//! refuses further tracking.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::crypto::{payload_digest, WriterKey};
use crate::error::VaultError;

/// The writer-key half of a lease.
#[derive(Debug, Clone)]
pub struct WriterPackage {
    /// The raw writer key. `None` on stripped copies.
    pub writer_key: Option<WriterKey>,
    /// Hex SHA-256 of the key bytes; safe to log.
    pub writer_key_digest: String,
}

/// A time-bounded writer-key delegation obtained from escrow.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub relay_key: String,
    pub escrow_id: String,
    pub requester_id: String,
    pub owner_peer_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Evidence the requester presented at unlock, carried for audit.
    pub evidence: Value,
    pub writer_package: WriterPackage,
    /// `sha256(writer_key || relay_key)` — binds key to relay without
    /// exposing it.
    pub payload_digest: String,
}

impl Lease {
    /// Build a lease around freshly unlocked writer-key bytes, computing the
    /// digests that accompany it.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_writer_key(
        lease_id: String,
        relay_key: String,
        escrow_id: String,
        requester_id: String,
        owner_peer_key: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        evidence: Value,
        writer_key: WriterKey,
    ) -> Self {
        let digest = payload_digest(&writer_key, &relay_key);
        let key_digest = writer_key.digest_hex();
        Self {
            lease_id,
            relay_key,
            escrow_id,
            requester_id,
            owner_peer_key,
            issued_at,
            expires_at,
            evidence,
            writer_package: WriterPackage {
                writer_key: Some(writer_key),
                writer_key_digest: key_digest,
            },
            payload_digest: digest,
        }
    }

    /// Whether the lease has expired relative to `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A copy with the writer key removed. Digests survive.
    #[must_use]
    pub fn stripped(&self) -> Self {
        let mut copy = self.clone();
        copy.writer_package.writer_key = None;
        copy
    }
}

/// Options for [`LeaseVault::track`] and [`LeaseVault::get`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SecretAccess {
    /// Return the writer key in the produced copy. Off by default.
    pub include_secret: bool,
}

#[derive(Default)]
struct Inner {
    /// All tracked leases, keyed by lease id.
    leases: HashMap<String, Lease>,
    /// relay key → lease id of the most recent lease.
    by_relay: HashMap<String, String>,
    destroyed: bool,
}

/// Per-process owner of writer-key bytes.
pub struct LeaseVault {
    inner: Mutex<Inner>,
}

impl LeaseVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Track a lease, supplanting any previous lease for the same relay key.
    ///
    /// The previous lease's secret is zeroized before the new lease becomes
    /// visible. Returns a copy of the tracked lease — stripped unless
    /// `access.include_secret` is set.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Destroyed`] after [`destroy`](Self::destroy).
    pub fn track(&self, lease: Lease, access: SecretAccess) -> Result<Lease, VaultError> {
        let mut inner = self.lock();
        if inner.destroyed {
            return Err(VaultError::Destroyed);
        }

        if let Some(old_id) = inner.by_relay.remove(&lease.relay_key) {
            if let Some(old) = inner.leases.remove(&old_id) {
                wipe(old);
                info!(relay_key = %lease.relay_key, old_lease = %old_id, "lease supplanted");
            }
        }

        let copy = if access.include_secret {
            lease.clone()
        } else {
            lease.stripped()
        };
        inner
            .by_relay
            .insert(lease.relay_key.clone(), lease.lease_id.clone());
        inner.leases.insert(lease.lease_id.clone(), lease);
        Ok(copy)
    }

    /// Look up the active lease for a relay key.
    ///
    /// Returns a stripped copy unless `access.include_secret` is set, in
    /// which case the copy carries a fresh, independently-owned buffer.
    #[must_use]
    pub fn get(&self, relay_key: &str, access: SecretAccess) -> Option<Lease> {
        let inner = self.lock();
        let lease_id = inner.by_relay.get(relay_key)?;
        let lease = inner.leases.get(lease_id)?;
        Some(if access.include_secret {
            lease.clone()
        } else {
            lease.stripped()
        })
    }

    /// All tracked leases, stripped, sorted by relay key.
    #[must_use]
    pub fn list(&self) -> Vec<Lease> {
        let inner = self.lock();
        let mut out: Vec<Lease> = inner.leases.values().map(Lease::stripped).collect();
        out.sort_by(|a, b| a.relay_key.cmp(&b.relay_key));
        out
    }

    /// Release and zeroize the lease for a relay key, returning the stripped
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when nothing is tracked for the key.
    pub fn release(&self, relay_key: &str, reason: &str) -> Result<Lease, VaultError> {
        let mut inner = self.lock();
        let lease_id = inner
            .by_relay
            .remove(relay_key)
            .ok_or_else(|| VaultError::NotFound {
                relay_key: relay_key.to_owned(),
            })?;
        let lease = inner
            .leases
            .remove(&lease_id)
            .ok_or_else(|| VaultError::NotFound {
                relay_key: relay_key.to_owned(),
            })?;
        let stripped = lease.stripped();
        wipe(lease);
        info!(relay_key = %relay_key, reason = %reason, "lease released");
        Ok(stripped)
    }

    /// Release every lease that originated from the given escrow id.
    pub fn release_by_escrow_id(&self, escrow_id: &str, reason: &str) -> Vec<Lease> {
        self.release_where(reason, |lease| lease.escrow_id == escrow_id)
    }

    /// Release every lease expired at `now`.
    pub fn release_expired(&self, now: DateTime<Utc>, reason: &str) -> Vec<Lease> {
        self.release_where(reason, |lease| lease.is_expired_at(now))
    }

    /// Release everything. Returns the number of leases wiped.
    pub fn clear_all(&self, reason: &str) -> usize {
        let mut inner = self.lock();
        let count = inner.leases.len();
        inner.by_relay.clear();
        for (_, lease) in inner.leases.drain() {
            wipe(lease);
        }
        if count > 0 {
            info!(count, reason = %reason, "lease vault cleared");
        }
        count
    }

    /// Wipe everything and refuse further tracking. Called by the binary on
    /// shutdown after the drain deadline.
    pub fn destroy(&self, reason: &str) {
        let count = self.clear_all(reason);
        let mut inner = self.lock();
        inner.destroyed = true;
        info!(count, reason = %reason, "lease vault destroyed");
    }

    /// Number of tracked leases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().leases.len()
    }

    /// Whether the vault tracks no leases.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_where(&self, reason: &str, predicate: impl Fn(&Lease) -> bool) -> Vec<Lease> {
        let mut inner = self.lock();
        let matching: Vec<String> = inner
            .leases
            .values()
            .filter(|lease| predicate(lease))
            .map(|lease| lease.lease_id.clone())
            .collect();

        let mut released = Vec::with_capacity(matching.len());
        for lease_id in matching {
            if let Some(lease) = inner.leases.remove(&lease_id) {
                inner.by_relay.remove(&lease.relay_key);
                released.push(lease.stripped());
                wipe(lease);
            }
        }
        if !released.is_empty() {
            info!(count = released.len(), reason = %reason, "leases batch-released");
        }
        released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("lease vault mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for LeaseVault {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LeaseVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseVault")
            .field("leases", &self.len())
            .finish_non_exhaustive()
    }
}

/// Zeroize a lease's writer key in place before the lease is dropped.
fn wipe(mut lease: Lease) {
    if let Some(mut key) = lease.writer_package.writer_key.take() {
        key.zeroize();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease(relay: &str, lease_id: &str, escrow_id: &str, ttl_secs: i64) -> Lease {
        Lease::with_writer_key(
            lease_id.to_owned(),
            relay.to_owned(),
            escrow_id.to_owned(),
            "gateway-1".to_owned(),
            "owner-peer".to_owned(),
            Utc::now(),
            Utc::now() + Duration::seconds(ttl_secs),
            serde_json::json!({"challenge": "signed"}),
            WriterKey::from_bytes(vec![0x5A; 32]),
        )
    }

    #[test]
    fn default_get_strips_the_secret() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();

        let copy = vault.get("relay-a", SecretAccess::default()).unwrap();
        assert!(copy.writer_package.writer_key.is_none());
        // The digest survives stripping.
        assert_eq!(copy.writer_package.writer_key_digest.len(), 64);
    }

    #[test]
    fn opt_in_returns_an_independent_secret_copy() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();

        let copy = vault
            .get("relay-a", SecretAccess { include_secret: true })
            .unwrap();
        let key = copy.writer_package.writer_key.unwrap();
        assert_eq!(key.as_bytes(), &[0x5A; 32]);
    }

    #[test]
    fn track_supplants_previous_lease_for_relay() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();
        vault
            .track(lease("relay-a", "l2", "e2", 60), SecretAccess::default())
            .unwrap();

        assert_eq!(vault.len(), 1);
        let current = vault.get("relay-a", SecretAccess::default()).unwrap();
        assert_eq!(current.lease_id, "l2");
    }

    #[test]
    fn release_removes_and_returns_stripped() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();

        let released = vault.release("relay-a", "test").unwrap();
        assert!(released.writer_package.writer_key.is_none());
        assert!(vault.get("relay-a", SecretAccess::default()).is_none());
        assert!(vault.is_empty());
    }

    #[test]
    fn release_unknown_relay_errors() {
        let vault = LeaseVault::new();
        let err = vault.release("relay-x", "test").unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[test]
    fn release_by_escrow_id_hits_only_matching() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();
        vault
            .track(lease("relay-b", "l2", "e2", 60), SecretAccess::default())
            .unwrap();

        let released = vault.release_by_escrow_id("e1", "escrow revoked");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].relay_key, "relay-a");
        assert!(vault.get("relay-b", SecretAccess::default()).is_some());
    }

    #[test]
    fn release_expired_sweeps_only_past_deadline() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", -5), SecretAccess::default())
            .unwrap();
        vault
            .track(lease("relay-b", "l2", "e2", 300), SecretAccess::default())
            .unwrap();

        let released = vault.release_expired(Utc::now(), "expiry sweep");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].relay_key, "relay-a");
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn destroy_wipes_and_refuses_new_leases() {
        let vault = LeaseVault::new();
        vault
            .track(lease("relay-a", "l1", "e1", 60), SecretAccess::default())
            .unwrap();
        vault.destroy("shutdown");

        assert!(vault.is_empty());
        let err = vault
            .track(lease("relay-b", "l2", "e2", 60), SecretAccess::default())
            .unwrap_err();
        assert!(matches!(err, VaultError::Destroyed));
    }

    #[test]
    fn writer_key_zeroizes_on_explicit_wipe() {
        // Observes the wipe contract directly on the key type the vault uses.
        let mut key = WriterKey::from_bytes(vec![0xCC; 32]);
        key.zeroize();
        assert!(key.is_zeroed());
    }
}
