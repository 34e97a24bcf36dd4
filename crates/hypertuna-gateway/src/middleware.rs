//! Request authentication helpers.
//!
//! Three gates guard the edge:
//!
//! - **Bearer tokens** on the WebSocket tunnel (`?token=` or
//!   `Authorization: Bearer`).
//! - **Shared-secret signatures** on the token endpoints — an HMAC over the
//!   canonical payload, with the client id and timestamp carried in the
//!   `X-Hypertuna-Client-Id` / `X-Hypertuna-Timestamp` headers and the
//!   signature in the request envelope.
//! - **Admin token** on debug and policy endpoints. With no admin token
//!   configured the gated routes answer 404, hiding their existence.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use serde_json::Value;

use hypertuna_core::signing::{verify_request, DEFAULT_TOLERANCE_MS};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the signing client id.
pub const HEADER_CLIENT_ID: &str = "x-hypertuna-client-id";

/// Header carrying the signing timestamp (milliseconds since epoch).
pub const HEADER_TIMESTAMP: &str = "x-hypertuna-timestamp";

/// Header carrying the admin token.
pub const HEADER_ADMIN_TOKEN: &str = "x-hypertuna-admin-token";

/// Client id assumed when the header is absent (the public web client).
const DEFAULT_CLIENT_ID: &str = "public-web";

/// Extract a bearer token from the `Authorization` header or a `token`
/// query value.
#[must_use]
pub fn extract_bearer(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_owned());
        }
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Verify the shared-secret HMAC on a signed envelope.
///
/// No-op when the gateway has no shared secret configured.
///
/// # Errors
///
/// - [`AppError::Unauthorized`] for a missing or wrong signature.
/// - [`AppError::BadRequest`] for a malformed timestamp header.
pub fn verify_shared_secret(
    state: &AppState,
    headers: &HeaderMap,
    payload: &Value,
    signature: Option<&str>,
) -> Result<(), AppError> {
    let Some(secret) = &state.config.shared_secret else {
        return Ok(());
    };

    let signature = signature
        .ok_or_else(|| AppError::Unauthorized("signature required".to_owned()))?;

    let client_id = headers
        .get(HEADER_CLIENT_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CLIENT_ID);

    let ts_ms: i64 = headers
        .get(HEADER_TIMESTAMP)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing timestamp header".to_owned()))?
        .parse()
        .map_err(|_| AppError::BadRequest("malformed timestamp header".to_owned()))?;

    verify_request(
        secret.as_bytes(),
        client_id,
        payload,
        ts_ms,
        signature,
        DEFAULT_TOLERANCE_MS,
    )?;
    Ok(())
}

/// Require the configured admin token.
///
/// # Errors
///
/// - [`AppError::NotFound`] when no admin token is configured at all.
/// - [`AppError::Forbidden`] when the presented token does not match.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &state.config.admin_token else {
        return Err(AppError::NotFound("not found".to_owned()));
    };

    let presented = headers
        .get(HEADER_ADMIN_TOKEN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented != expected.as_str() {
        return Err(AppError::Forbidden("admin token required".to_owned()));
    }
    Ok(())
}
