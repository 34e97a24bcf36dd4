//! Relay token endpoints: `/api/relay-tokens/*`
//!
//! Issue and refresh bearer tokens for relay tunnels. Bodies arrive in a
//! `{payload, signature}` envelope; in shared-secret mode the signature is
//! an HMAC over the canonical payload (client id and timestamp ride in the
//! `X-Hypertuna-*` headers).

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hypertuna_core::token::{IssueOptions, IssuedToken, RefreshOptions};

use crate::error::AppError;
use crate::middleware::verify_shared_secret;
use crate::state::AppState;

/// Build the `/api/relay-tokens` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/issue", post(issue_token))
        .route("/refresh", post(refresh_token))
}

// ── Request / Response types ─────────────────────────────────────────

/// The signed request envelope. The raw payload value is kept for HMAC
/// verification before it is parsed into the typed shape.
#[derive(Debug, Deserialize)]
pub struct SignedEnvelope {
    pub payload: Value,
    pub signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuePayload {
    pub relay_key: String,
    /// Worker-issued auth token, carried opaquely into the token record.
    pub relay_auth_token: Option<String>,
    pub pubkey: Option<String>,
    pub scope: Option<String>,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPayload {
    pub relay_key: String,
    pub token: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_after: DateTime<Utc>,
    pub sequence: u64,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            expires_at: issued.expires_at,
            refresh_after: issued.refresh_after,
            sequence: issued.sequence,
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `POST /api/relay-tokens/issue`
async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<Json<TokenResponse>, AppError> {
    verify_shared_secret(&state, &headers, &envelope.payload, envelope.signature.as_deref())?;

    let payload: IssuePayload = serde_json::from_value(envelope.payload)
        .map_err(|e| AppError::BadRequest(format!("bad issue payload: {e}")))?;
    validate_relay_key(&payload.relay_key)?;

    if !state.token_rate_limiter.check(&payload.relay_key) {
        return Err(AppError::RateLimited("token issue budget exceeded".to_owned()));
    }

    let issued = state
        .token_service
        .issue(
            &payload.relay_key,
            IssueOptions {
                scope: payload.scope,
                ttl_seconds: payload.ttl_seconds,
                issued_by: None,
                pubkey: payload.pubkey,
                relay_auth_token: payload.relay_auth_token,
            },
        )
        .await?;

    state.metrics.incr_counter("tokens_issued", 1);
    Ok(Json(issued.into()))
}

/// `POST /api/relay-tokens/refresh`
async fn refresh_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<Json<TokenResponse>, AppError> {
    verify_shared_secret(&state, &headers, &envelope.payload, envelope.signature.as_deref())?;

    let payload: RefreshPayload = serde_json::from_value(envelope.payload)
        .map_err(|e| AppError::BadRequest(format!("bad refresh payload: {e}")))?;
    validate_relay_key(&payload.relay_key)?;

    if !state.token_rate_limiter.check(&payload.relay_key) {
        return Err(AppError::RateLimited("token refresh budget exceeded".to_owned()));
    }

    let refreshed = state
        .token_service
        .refresh(
            &payload.relay_key,
            RefreshOptions {
                token: payload.token,
                sequence: None,
                requested_ttl_seconds: payload.ttl_seconds,
            },
        )
        .await?;

    state.metrics.incr_counter("tokens_refreshed", 1);
    Ok(Json(refreshed.into()))
}

fn validate_relay_key(relay_key: &str) -> Result<(), AppError> {
    let valid = relay_key.len() == 64 && relay_key.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest("relayKey must be 64 hex chars".to_owned()))
    }
}
