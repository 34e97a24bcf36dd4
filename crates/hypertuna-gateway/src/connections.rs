//! Live-connection table and tunnel audit events.
//!
//! Every relay tunnel moves through `handshaking → authenticated →
//! tunneling → closing`; terminal transitions emit a structured audit event.
//! `GET /debug/connections` reads a snapshot of this table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use hypertuna_core::telemetry::TelemetrySink;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnState {
    Handshaking,
    Authenticated,
    Tunneling,
    Closing,
}

/// One tracked tunnel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub relay_key: String,
    /// Assigned worker peer, once dispatch succeeds.
    pub peer_id: Option<String>,
    pub state: ConnState,
    pub opened_at: DateTime<Utc>,
}

/// Shared table of live tunnels.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<HashMap<String, ConnectionInfo>>>,
}

impl ConnectionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection in the handshaking state. Returns its id.
    pub async fn open(&self, relay_key: &str) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let info = ConnectionInfo {
            connection_id: connection_id.clone(),
            relay_key: relay_key.to_owned(),
            peer_id: None,
            state: ConnState::Handshaking,
            opened_at: Utc::now(),
        };
        self.inner.write().await.insert(connection_id.clone(), info);
        connection_id
    }

    /// Advance a connection's state, recording the assigned peer when known.
    pub async fn transition(&self, connection_id: &str, state: ConnState, peer_id: Option<&str>) {
        let mut table = self.inner.write().await;
        if let Some(info) = table.get_mut(connection_id) {
            info.state = state;
            if let Some(peer_id) = peer_id {
                info.peer_id = Some(peer_id.to_owned());
            }
        }
    }

    /// Remove a connection, emitting the terminal audit event.
    pub async fn close(
        &self,
        connection_id: &str,
        outcome: &str,
        telemetry: &dyn TelemetrySink,
    ) {
        let removed = self.inner.write().await.remove(connection_id);
        if let Some(info) = removed {
            let duration_ms = (Utc::now() - info.opened_at).num_milliseconds();
            info!(
                connection_id = %info.connection_id,
                relay_key = %info.relay_key,
                peer_id = info.peer_id.as_deref().unwrap_or("-"),
                outcome = %outcome,
                duration_ms,
                "tunnel closed"
            );
            telemetry.event(
                "tunnel_closed",
                &serde_json::json!({
                    "connectionId": info.connection_id,
                    "relayKey": info.relay_key,
                    "peerId": info.peer_id,
                    "outcome": outcome,
                    "durationMs": duration_ms,
                }),
            );
        }
    }

    /// Snapshot of all live connections, sorted by open time.
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let table = self.inner.read().await;
        let mut out: Vec<ConnectionInfo> = table.values().cloned().collect();
        out.sort_by_key(|c| c.opened_at);
        out
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no tunnels are live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hypertuna_core::telemetry::NullTelemetry;

    #[tokio::test]
    async fn lifecycle_tracks_state_and_peer() {
        let table = ConnectionTable::new();
        let id = table.open("relay-key").await;

        table
            .transition(&id, ConnState::Authenticated, None)
            .await;
        table
            .transition(&id, ConnState::Tunneling, Some("peer-1"))
            .await;

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, ConnState::Tunneling);
        assert_eq!(snapshot[0].peer_id.as_deref(), Some("peer-1"));

        table.close(&id, "client-closed", &NullTelemetry).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn close_unknown_connection_is_a_noop() {
        let table = ConnectionTable::new();
        table.close("ghost", "whatever", &NullTelemetry).await;
        assert!(table.is_empty().await);
    }
}
