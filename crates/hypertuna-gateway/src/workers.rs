//! Background workers: lease maintenance, escrow revocation polling, and
//! stale-peer ejection.
//!
//! Every worker is a `tokio::select!` loop over its interval and the
//! shutdown watch channel, so a signal stops all of them promptly.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hypertuna_core::escrow::UnlockRequest;
use hypertuna_core::vault::SecretAccess;

use crate::state::AppState;

/// Sweep expired leases and renew those inside their renewal window.
///
/// Renewal re-unlocks the escrow before `expires_at`; the fresh lease
/// supplants the old one in the vault (which zeroizes the old secret).
pub async fn lease_maintenance_worker(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    info!(interval_secs, "lease maintenance worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();

                let expired = state.vault.release_expired(now, "expiry sweep");
                if !expired.is_empty() {
                    state.metrics.incr_counter("leases_expired", expired.len() as u64);
                }

                let (Some(client), Some(recipient)) =
                    (&state.escrow_client, &state.escrow_recipient)
                else {
                    continue;
                };

                // Renew leases that will expire within the next two ticks.
                let horizon = now + chrono::Duration::seconds((interval_secs * 2) as i64);
                for lease in state.vault.list() {
                    if lease.expires_at > horizon {
                        continue;
                    }
                    let request = UnlockRequest {
                        escrow_id: lease.escrow_id.clone(),
                        requester_id: lease.requester_id.clone(),
                        evidence: json!({
                            "renewal": true,
                            "previousLeaseId": lease.lease_id,
                        }),
                    };
                    match client.unlock(&request, recipient).await {
                        Ok(renewed) => {
                            let relay_key = renewed.relay_key.clone();
                            if let Err(e) = state.vault.track(renewed, SecretAccess::default()) {
                                warn!(relay_key = %relay_key, error = %e, "renewed lease rejected by vault");
                            } else {
                                state.metrics.incr_counter("leases_renewed", 1);
                                debug!(relay_key = %relay_key, "lease renewed");
                            }
                        }
                        Err(e) => {
                            warn!(escrow_id = %lease.escrow_id, error = %e, "lease renewal failed");
                            state.metrics.incr_counter("lease_renewal_failures", 1);
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("lease maintenance worker shutting down");
                return;
            }
        }
    }
}

/// Poll the escrow revocation feed and release matching leases.
pub async fn revocation_poll_worker(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    interval_secs: u64,
) {
    let Some(client) = state.escrow_client.clone() else {
        return;
    };
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    let mut last_poll = Utc::now();
    info!(interval_secs, "revocation poll worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match client.fetch_revocations(last_poll).await {
                    Ok(revocations) => {
                        last_poll = Utc::now();
                        for revocation in &revocations {
                            let released = state
                                .vault
                                .release_by_escrow_id(&revocation.escrow_id, &revocation.reason);
                            if !released.is_empty() {
                                info!(
                                    escrow_id = %revocation.escrow_id,
                                    reason = %revocation.reason,
                                    count = released.len(),
                                    "leases released on escrow revocation"
                                );
                                state.metrics.incr_counter(
                                    "leases_revoked",
                                    released.len() as u64,
                                );
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "revocation poll failed, will retry next tick");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("revocation poll worker shutting down");
                return;
            }
        }
    }
}

/// Periodically drop peers whose heartbeat went stale.
pub async fn stale_peer_worker(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let ejected = state.registry.eject_stale_peers().await;
                if !ejected.is_empty() {
                    state.metrics.incr_counter("peers_ejected", ejected.len() as u64);
                }
                state
                    .metrics
                    .set_gauge("peers_live", state.registry.live_peer_count().await as f64);
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}
