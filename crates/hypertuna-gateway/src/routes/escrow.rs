//! Escrow REST service: `/escrow/*`
//!
//! The deposit-holding half of the escrow protocol, speaking the same wire
//! contract the core escrow client consumes. Every request must carry the
//! `X-Escrow-Client-Id` / `X-Escrow-Timestamp` / `X-Escrow-Signature`
//! header trio; signatures are HMACs over the canonical body with the
//! shared escrow secret.
//!
//! The service stays blind: deposits hold sealed payloads it cannot open,
//! and `unlock` returns the sealed blob for the requester to open with its
//! own recipient secret.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use hypertuna_core::escrow::{DepositRequest, EscrowPolicy, LeasePolicy};
use hypertuna_core::signing::{verify_request, DEFAULT_TOLERANCE_MS};

use crate::error::AppError;
use crate::escrow_db::{self, status, DepositRow, EscrowDbError, LeaseRow};
use crate::state::AppState;

/// Longest lease the service grants regardless of deposit policy.
const MAX_LEASE_SECONDS: i64 = 3600;

/// Build the `/escrow` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/policy", get(fetch_policy))
        .route("/", post(deposit))
        .route("/unlock", post(unlock))
        .route("/revoke", post(revoke))
        .route("/leases", get(list_leases))
        .route("/revocations", get(list_revocations))
}

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockBody {
    pub escrow_id: String,
    pub requester_id: String,
    #[serde(default)]
    pub evidence: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeBody {
    pub escrow_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RevocationsQuery {
    /// Milliseconds since epoch.
    pub since: Option<i64>,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /escrow/policy`
async fn fetch_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<EscrowPolicy>, AppError> {
    verify_escrow_headers(&state, &headers, &json!({}))?;
    Ok(Json(EscrowPolicy {
        max_lease_seconds: MAX_LEASE_SECONDS,
        require_evidence: true,
        version: env!("CARGO_PKG_VERSION").to_owned(),
    }))
}

/// `POST /escrow` — persist a sealed writer key.
async fn deposit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    verify_escrow_headers(&state, &headers, &body)?;
    let request: DepositRequest = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("bad deposit: {e}")))?;
    let pool = escrow_pool(&state)?;

    let sealed_payload = serde_json::to_value(&request.sealed_writer_key)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let policy = serde_json::to_value(&request.policy)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let row = DepositRow {
        escrow_id: request.escrow_id,
        owner_peer_key: request.owner_peer_key,
        relay_key: request.relay_key,
        sealed_payload,
        recipient_public_key: request.recipient_public_key,
        policy,
        deposited_at: Utc::now(),
        status: status::DEPOSITED.to_owned(),
    };
    escrow_db::insert_deposit(pool, &row)
        .await
        .map_err(map_db_error)?;

    state.metrics.incr_counter("escrow_deposits", 1);
    Ok(Json(json!({ "status": status::DEPOSITED })))
}

/// `POST /escrow/unlock` — grant a time-bounded lease on a deposit.
async fn unlock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    verify_escrow_headers(&state, &headers, &body)?;
    let request: UnlockBody = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("bad unlock: {e}")))?;
    let pool = escrow_pool(&state)?;

    let deposit = escrow_db::get_deposit(pool, &request.escrow_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("unknown escrow id".to_owned()))?;

    match deposit.status.as_str() {
        status::DEPOSITED | status::UNLOCKED => {}
        status::REVOKED => {
            return Err(AppError::Conflict("deposit revoked".to_owned()));
        }
        _ => return Err(AppError::Conflict("deposit expired".to_owned())),
    }

    let lease_policy: LeasePolicy = serde_json::from_value(deposit.policy.clone())
        .unwrap_or(LeasePolicy {
            lease_seconds: MAX_LEASE_SECONDS,
        });
    let lease_seconds = lease_policy.lease_seconds.clamp(1, MAX_LEASE_SECONDS);

    let now = Utc::now();
    let lease = LeaseRow {
        lease_id: uuid::Uuid::new_v4().to_string(),
        escrow_id: deposit.escrow_id.clone(),
        relay_key: deposit.relay_key.clone(),
        requester_id: request.requester_id.clone(),
        issued_at: now,
        expires_at: now + Duration::seconds(lease_seconds),
        evidence: request.evidence,
        // The service cannot open the payload; the digest commits to the
        // sealed bytes instead.
        payload_digest: hypertuna_core::crypto::sha256_hex(
            deposit.sealed_payload.to_string().as_bytes(),
        ),
    };
    escrow_db::insert_lease(pool, &lease).await.map_err(map_db_error)?;
    escrow_db::set_deposit_status(pool, &deposit.escrow_id, status::UNLOCKED)
        .await
        .map_err(map_db_error)?;

    state.metrics.incr_counter("escrow_unlocks", 1);
    Ok(Json(wire_lease(&lease, &deposit)))
}

/// `POST /escrow/revoke` — mark a deposit revoked.
async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    verify_escrow_headers(&state, &headers, &body)?;
    let request: RevokeBody = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("bad revoke: {e}")))?;
    let pool = escrow_pool(&state)?;

    escrow_db::get_deposit(pool, &request.escrow_id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("unknown escrow id".to_owned()))?;

    escrow_db::revoke_deposit(pool, &request.escrow_id, &request.reason)
        .await
        .map_err(map_db_error)?;

    state.metrics.incr_counter("escrow_revocations", 1);
    Ok(Json(json!({ "status": status::REVOKED })))
}

/// `GET /escrow/leases` — active leases, with their sealed payloads.
async fn list_leases(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, AppError> {
    verify_escrow_headers(&state, &headers, &json!({}))?;
    let pool = escrow_pool(&state)?;

    let leases = escrow_db::list_active_leases(pool).await.map_err(map_db_error)?;
    let mut out = Vec::with_capacity(leases.len());
    for lease in &leases {
        if let Some(deposit) = escrow_db::get_deposit(pool, &lease.escrow_id)
            .await
            .map_err(map_db_error)?
        {
            out.push(wire_lease(lease, &deposit));
        }
    }
    Ok(Json(out))
}

/// `GET /escrow/revocations?since=<ms>` — the revocation feed.
async fn list_revocations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RevocationsQuery>,
) -> Result<Json<Vec<Value>>, AppError> {
    verify_escrow_headers(&state, &headers, &json!({}))?;
    let pool = escrow_pool(&state)?;

    let since = query
        .since
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));

    let revocations = escrow_db::list_revocations_since(pool, since)
        .await
        .map_err(map_db_error)?;
    let out = revocations
        .iter()
        .map(|r| {
            json!({
                "escrowId": r.escrow_id,
                "reason": r.reason,
                "revokedAt": r.revoked_at,
            })
        })
        .collect();
    Ok(Json(out))
}

// ── Helpers ──────────────────────────────────────────────────────────

/// The wire shape the core escrow client decodes as `WireLease`.
fn wire_lease(lease: &LeaseRow, deposit: &DepositRow) -> Value {
    json!({
        "leaseId": lease.lease_id,
        "escrowId": lease.escrow_id,
        "relayKey": lease.relay_key,
        "requesterId": lease.requester_id,
        "ownerPeerKey": deposit.owner_peer_key,
        "issuedAt": lease.issued_at,
        "expiresAt": lease.expires_at,
        "evidence": lease.evidence,
        "sealedWriterKey": deposit.sealed_payload,
        "payloadDigest": lease.payload_digest,
    })
}

fn verify_escrow_headers(
    state: &AppState,
    headers: &HeaderMap,
    body: &Value,
) -> Result<(), AppError> {
    let Some(escrow) = &state.config.escrow else {
        return Err(AppError::Inactive("escrow service not configured".to_owned()));
    };

    let client_id = header_str(headers, "x-escrow-client-id")?;
    let ts_ms: i64 = header_str(headers, "x-escrow-timestamp")?
        .parse()
        .map_err(|_| AppError::BadRequest("malformed escrow timestamp".to_owned()))?;
    let signature = header_str(headers, "x-escrow-signature")?;

    verify_request(
        escrow.signing_secret.as_bytes(),
        &client_id,
        body,
        ts_ms,
        &signature,
        DEFAULT_TOLERANCE_MS,
    )?;
    Ok(())
}

fn header_str(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {name} header")))
}

fn escrow_pool(state: &AppState) -> Result<&sqlx::PgPool, AppError> {
    state
        .escrow_pool
        .as_ref()
        .ok_or_else(|| AppError::Inactive("escrow persistence not configured".to_owned()))
}

fn map_db_error(err: EscrowDbError) -> AppError {
    match err {
        EscrowDbError::Duplicate => AppError::Conflict("escrow id already deposited".to_owned()),
        EscrowDbError::Migration { .. } | EscrowDbError::Database(_) => {
            AppError::Internal(err.to_string())
        }
    }
}
