//! Relay registry endpoints: `/api/relays/*` and the peer heartbeat.
//!
//! Registration and deregistration are worker-facing (HMAC proof of
//! possession inside the body); resolution is public; policy updates are
//! admin-only.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use hypertuna_core::dispatch::PeerMetricsReport;
use hypertuna_core::registry::{
    PeerInfo, RegisterRequest, RegistrationResponse, RelayPolicy, RelayPolicyPatch, RelayRecord,
};

use crate::error::AppError;
use crate::middleware::require_admin;
use crate::state::AppState;

/// Build the `/api/relays` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register_relay))
        .route("/deregister", post(deregister_relay))
        .route("/{identifier}", get(resolve_relay))
        .route("/{relay_key}/policy", patch(update_policy))
}

/// Build the `/api/peers` router.
pub fn peers_router() -> Router<Arc<AppState>> {
    Router::new().route("/heartbeat", post(peer_heartbeat))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterBody {
    pub relay_key: String,
    pub peer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub relay: RelayRecord,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub peer_id: String,
    pub endpoint: Option<String>,
    /// Worker-reported metrics, forwarded to the dispatcher.
    #[serde(default)]
    pub metrics: Option<PeerMetricsReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub accepted: bool,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `POST /api/relays/register` — worker peer binds itself to a relay.
async fn register_relay(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegistrationResponse>, AppError> {
    let response = state.registry.register(request).await?;
    state.metrics.incr_counter("relays_registered", 1);
    Ok(Json(response))
}

/// `POST /api/relays/deregister` — idempotent unbind.
async fn deregister_relay(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeregisterBody>,
) -> Result<StatusCode, AppError> {
    state.registry.deregister(&body.relay_key, &body.peer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/relays/{identifier}` — resolve a relay key or `npub:name`.
async fn resolve_relay(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
) -> Result<Json<ResolveResponse>, AppError> {
    let resolved = state.registry.resolve(&identifier).await?;
    Ok(Json(ResolveResponse {
        relay: resolved.relay,
        peers: resolved.peers,
    }))
}

/// `PATCH /api/relays/{relay_key}/policy` — admin-only policy update.
async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path(relay_key): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<RelayPolicyPatch>,
) -> Result<Json<RelayPolicy>, AppError> {
    require_admin(&state, &headers)?;
    let policy = state.registry.update_policy(&relay_key, &patch).await?;
    Ok(Json(policy))
}

/// `POST /api/peers/heartbeat` — liveness plus dispatcher metrics.
async fn peer_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let accepted = state
        .registry
        .record_heartbeat(&body.peer_id, body.endpoint.as_deref())
        .await;

    if let Some(metrics) = &body.metrics {
        state.dispatcher.report_peer_metrics(&body.peer_id, metrics);
    }

    state.metrics.incr_counter("peer_heartbeats", 1);
    Ok(Json(HeartbeatResponse { accepted }))
}
