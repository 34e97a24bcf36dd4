//! System endpoints: health, metrics, debug connections, and the
//! well-known shared-secret fingerprint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use hypertuna_core::crypto::sha256_hex;

use crate::connections::ConnectionInfo;
use crate::error::AppError;
use crate::middleware::require_admin;
use crate::state::AppState;

/// Build the system router (mounted at `/`).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/debug/connections", get(debug_connections))
        .route(
            "/.well-known/hypertuna-gateway-secret",
            get(well_known_secret),
        )
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
    pub live_peers: usize,
    pub open_tunnels: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretFingerprint {
    /// `sha256(shared_secret)` hex, or empty when no secret is set.
    pub secret_hash: String,
    pub shared_secret_version: u32,
    pub open_access: bool,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /health` — liveness probe.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        live_peers: state.registry.live_peer_count().await,
        open_tunnels: state.connections.len().await,
    })
}

/// `GET /metrics` — Prometheus text format.
///
/// Unauthenticated by design: Prometheus scrapes this.
async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut lines = Vec::with_capacity(64);

    for (name, value) in state.metrics.counters() {
        lines.push(format!("# TYPE hypertuna_{name} counter"));
        lines.push(format!("hypertuna_{name} {value}"));
    }
    for (name, value) in state.metrics.gauges() {
        lines.push(format!("# TYPE hypertuna_{name} gauge"));
        lines.push(format!("hypertuna_{name} {value}"));
    }

    lines.push("# TYPE hypertuna_open_tunnels gauge".to_owned());
    lines.push(format!(
        "hypertuna_open_tunnels {}",
        state.connections.len().await
    ));
    lines.push("# TYPE hypertuna_jobs_in_flight gauge".to_owned());
    lines.push(format!(
        "hypertuna_jobs_in_flight {}",
        state.dispatcher.jobs_in_flight()
    ));
    lines.push("# TYPE hypertuna_info gauge".to_owned());
    lines.push(format!(
        "hypertuna_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    ));

    let body = lines.join("\n") + "\n";
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// `GET /debug/connections` — live tunnel table. Admin-only.
async fn debug_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectionInfo>>, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.connections.snapshot().await))
}

/// `GET /.well-known/hypertuna-gateway-secret` — the shared-secret
/// fingerprint for client bootstrapping. Never the secret itself.
async fn well_known_secret(State(state): State<Arc<AppState>>) -> Json<SecretFingerprint> {
    let secret_hash = state
        .config
        .shared_secret
        .as_deref()
        .map(|s| sha256_hex(s.as_bytes()))
        .unwrap_or_default();

    Json(SecretFingerprint {
        secret_hash,
        shared_secret_version: state.config.shared_secret_version,
        open_access: state.config.open_access,
    })
}
