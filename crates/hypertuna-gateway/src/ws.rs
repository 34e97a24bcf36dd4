//! The relay WebSocket tunnel: `GET /relay?token=…`
//!
//! A client authenticates with a bearer token (query or `Authorization`
//! header), the gateway resolves the relay from the token's subject, asks
//! the dispatcher for a worker peer, opens the framed peer link, and pumps
//! frames verbatim in both directions until either side closes.
//!
//! Dispatcher rejections and dead relays answer with a single
//! `["NOTICE","<reason>"]` frame and a close: code 1013 (try again later)
//! for saturation and no-live-peer, 1011 for internal failures. Either half
//! closing tears the whole tunnel down; the dispatch slot returns through
//! `fail(job, "client-cancelled")` when the client hung up, and
//! `acknowledge` when the peer finished cleanly.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio_util::bytes::Bytes;
use tracing::{debug, warn};

use hypertuna_core::dispatch::{JobRequest, RejectReason, ScheduleOutcome};
use hypertuna_core::error::RegistryError;
use hypertuna_core::registry::Resolved;

use crate::connections::ConnState;
use crate::error::AppError;
use crate::middleware::extract_bearer;
use crate::peer_link::PeerLink;
use crate::state::AppState;

/// Close code for "try again later" rejections.
const CLOSE_TRY_LATER: u16 = 1013;

/// Close code for internal failures.
const CLOSE_INTERNAL: u16 = 1011;

/// Build the `/relay` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/relay", any(relay_upgrade))
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub token: Option<String>,
    /// Optional explicit relay identifier; must match the token subject.
    pub relay: Option<String>,
}

/// `GET /relay` — authenticate, then upgrade into the tunnel.
///
/// The token check runs before the upgrade so unauthenticated probes get a
/// plain 401 instead of a half-open socket.
async fn relay_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RelayQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = extract_bearer(&headers, query.token.as_deref()) else {
        return AppError::Unauthorized("token required".to_owned()).into_response();
    };

    let verification = match state.token_service.verify(&token).await {
        Ok(v) => v,
        Err(e) => return AppError::from(e).into_response(),
    };
    if !verification.valid {
        let reason = verification
            .reason
            .map_or("invalid", hypertuna_core::token::VerifyReason::as_slug);
        return AppError::Unauthorized(format!("token rejected: {reason}")).into_response();
    }

    let Some(subject) = verification.subject else {
        return AppError::Internal("verified token without subject".to_owned()).into_response();
    };

    // An explicit relay selector must agree with what the token grants.
    if let Some(requested) = &query.relay {
        if requested != &subject {
            return AppError::Forbidden("token does not grant this relay".to_owned())
                .into_response();
        }
    }

    let Ok(ws) = ws else {
        return AppError::BadRequest("websocket upgrade required".to_owned()).into_response();
    };
    ws.on_upgrade(move |socket| tunnel(state, socket, subject))
}

/// Run one tunnel to completion.
async fn tunnel(state: Arc<AppState>, mut socket: WebSocket, relay_identifier: String) {
    let connection_id = state.connections.open(&relay_identifier).await;
    state
        .connections
        .transition(&connection_id, ConnState::Authenticated, None)
        .await;
    state.metrics.incr_counter("tunnels_opened", 1);

    let resolved = match state.registry.resolve(&relay_identifier).await {
        Ok(resolved) => resolved,
        Err(e) => {
            let slug = match &e {
                RegistryError::NoLivePeer { .. } => "no-live-peer",
                RegistryError::UnknownRelay { .. } => "not-found",
                _ => "bad-request",
            };
            reject(&state, &mut socket, &connection_id, slug, CLOSE_TRY_LATER).await;
            return;
        }
    };

    let job = JobRequest {
        relay_id: resolved.relay.relay_key.clone(),
        peers: resolved.peers.iter().map(|p| p.peer_id.clone()).collect(),
    };
    let (job_id, peer_id) = match state.dispatcher.schedule(&job) {
        ScheduleOutcome::Assigned { job_id, peer_id } => (job_id, peer_id),
        ScheduleOutcome::Rejected { reason } => {
            let code = match reason {
                RejectReason::PeersSaturated | RejectReason::NoPeers => CLOSE_TRY_LATER,
                RejectReason::NoCandidate => CLOSE_INTERNAL,
            };
            reject(&state, &mut socket, &connection_id, reason.as_slug(), code).await;
            return;
        }
    };
    state.metrics.incr_counter("jobs_assigned", 1);

    let Some(endpoint) = peer_endpoint(&resolved, &peer_id) else {
        let _ = state.dispatcher.fail(&job_id, "peer-endpoint-missing");
        reject(&state, &mut socket, &connection_id, "no-candidate", CLOSE_INTERNAL).await;
        return;
    };

    let link = PeerLink::connect(
        &endpoint,
        &resolved.relay.relay_key,
        &gateway_client_id(&state),
        state.config.registration_secret.as_bytes(),
        state.config.peer_dial_timeout,
    )
    .await;
    let mut link = match link {
        Ok(link) => link,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "peer dial failed");
            let _ = state.dispatcher.fail(&job_id, "peer-dial-failed");
            reject(&state, &mut socket, &connection_id, "peer-unreachable", CLOSE_TRY_LATER).await;
            return;
        }
    };

    state
        .connections
        .transition(&connection_id, ConnState::Tunneling, Some(&peer_id))
        .await;

    let outcome = pump(&mut socket, &mut link).await;

    state
        .connections
        .transition(&connection_id, ConnState::Closing, None)
        .await;
    match &outcome {
        TunnelOutcome::PeerClosed => {
            let _ = state.dispatcher.acknowledge(&job_id, "peer-closed");
            state.metrics.incr_counter("jobs_completed", 1);
        }
        TunnelOutcome::ClientClosed => {
            let _ = state.dispatcher.fail(&job_id, "client-cancelled");
            state.metrics.incr_counter("jobs_client_cancelled", 1);
        }
        TunnelOutcome::Error(reason) => {
            let _ = state.dispatcher.fail(&job_id, reason);
            state.metrics.incr_counter("jobs_failed", 1);
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "tunnel closed".into(),
        })))
        .await;
    state
        .connections
        .close(&connection_id, outcome.as_str(), state.metrics.as_ref())
        .await;
}

/// Why a tunnel ended.
enum TunnelOutcome {
    PeerClosed,
    ClientClosed,
    Error(String),
}

impl TunnelOutcome {
    fn as_str(&self) -> &str {
        match self {
            Self::PeerClosed => "peer-closed",
            Self::ClientClosed => "client-closed",
            Self::Error(reason) => reason,
        }
    }
}

/// Pump frames both ways until either side closes or errors.
async fn pump(socket: &mut WebSocket, link: &mut PeerLink) -> TunnelOutcome {
    use futures::StreamExt;

    loop {
        tokio::select! {
            client_msg = socket.next() => {
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = link.send(Bytes::from(text.as_bytes().to_vec())).await {
                            return TunnelOutcome::Error(format!("peer-write: {e}"));
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Err(e) = link.send(Bytes::from(bytes.to_vec())).await {
                            return TunnelOutcome::Error(format!("peer-write: {e}"));
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return TunnelOutcome::ClientClosed;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return TunnelOutcome::ClientClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "client read error");
                        return TunnelOutcome::ClientClosed;
                    }
                }
            }
            peer_frame = link.next_frame() => {
                match peer_frame {
                    Some(Ok(frame)) => {
                        let message = match std::str::from_utf8(&frame) {
                            Ok(text) => Message::Text(text.to_owned().into()),
                            Err(_) => Message::Binary(Bytes::from(frame.to_vec())),
                        };
                        if socket.send(message).await.is_err() {
                            return TunnelOutcome::ClientClosed;
                        }
                    }
                    Some(Err(e)) => return TunnelOutcome::Error(format!("peer-read: {e}")),
                    None => return TunnelOutcome::PeerClosed,
                }
            }
        }
    }
}

/// Send a typed NOTICE and close the socket with the given code.
async fn reject(
    state: &Arc<AppState>,
    socket: &mut WebSocket,
    connection_id: &str,
    slug: &str,
    code: u16,
) {
    let notice = json!(["NOTICE", slug]).to_string();
    let _ = socket.send(Message::Text(notice.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: slug.to_owned().into(),
        })))
        .await;
    state.metrics.incr_counter("tunnels_rejected", 1);
    state
        .connections
        .close(connection_id, slug, state.metrics.as_ref())
        .await;
}

fn peer_endpoint(resolved: &Resolved, peer_id: &str) -> Option<String> {
    resolved
        .peers
        .iter()
        .find(|p| p.peer_id == peer_id)
        .map(|p| p.endpoint.clone())
}

/// Stable client id the gateway signs peer hellos with.
fn gateway_client_id(state: &Arc<AppState>) -> String {
    if state.config.display_name.is_empty() {
        "hypertuna-gateway".to_owned()
    } else {
        state.config.display_name.clone()
    }
}
