//! Edge API integration tests.
//!
//! Builds the same state and router the binary runs with, against the
//! in-memory backend, and drives it through Tower without binding a port.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use hypertuna_core::signing::sign_request;
use hypertuna_gateway::bootstrap::build_state;
use hypertuna_gateway::build_router;
use hypertuna_gateway::config::{GatewayConfig, StorageBackendType};
use hypertuna_gateway::state::AppState;

fn test_config(tmp: &std::path::Path) -> GatewayConfig {
    GatewayConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        storage_backend: StorageBackendType::Memory,
        log_level: "warn".to_owned(),
        shared_secret: None,
        shared_secret_version: 1,
        admin_token: None,
        registration_secret: "worker-registration-secret".to_owned(),
        peer_staleness_secs: 90,
        drain_deadline: Duration::from_secs(1),
        peer_dial_timeout: Duration::from_secs(1),
        escrow: None,
        escrow_database_url: None,
        mirror_enabled: false,
        mirror_storage_dir: tmp.join("blind-peer"),
        trusted_peers_persist_path: tmp.join("trusted-peers.json"),
        blind_peer_status_url: None,
        blind_peer_status_detail: false,
        blind_peer_status_owners: 10,
        blind_peer_status_cores_per_owner: 5,
        discovery_enabled: false,
        open_access: false,
        public_url: String::new(),
        ws_url: String::new(),
        secret_url: String::new(),
        display_name: String::new(),
        region: String::new(),
        discovery_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        discovery_key_seed: None,
        discovery_refresh_interval: Duration::from_secs(30),
        discovery_ttl_seconds: 60,
    }
}

async fn state_with(config: GatewayConfig) -> Arc<AppState> {
    build_state(config).await.unwrap()
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn relay_key() -> String {
    "ab".repeat(32)
}

#[tokio::test]
async fn health_reports_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["openTunnels"], 0);
}

#[tokio::test]
async fn token_issue_then_refresh_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let issue = json!({
        "payload": {
            "relayKey": relay_key(),
            "relayAuthToken": "worker-proof",
            "ttlSeconds": 3600,
        }
    });
    let (status, body) = send(&router, post_json("/api/relay-tokens/issue", &issue)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sequence"], 1);
    let token = body["token"].as_str().unwrap().to_owned();
    assert_eq!(token.len(), 32);

    let refresh = json!({
        "payload": {
            "relayKey": relay_key(),
            "token": token,
        }
    });
    let (status, body) = send(&router, post_json("/api/relay-tokens/refresh", &refresh)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sequence"], 2);
    assert_ne!(body["token"].as_str().unwrap(), "");
}

#[tokio::test]
async fn refresh_with_wrong_token_is_unauthorized() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let issue = json!({ "payload": { "relayKey": relay_key() } });
    let (status, _) = send(&router, post_json("/api/relay-tokens/issue", &issue)).await;
    assert_eq!(status, StatusCode::OK);

    let refresh = json!({
        "payload": {
            "relayKey": relay_key(),
            "token": "00000000000000000000000000000000",
        }
    });
    let (status, body) = send(&router, post_json("/api/relay-tokens/refresh", &refresh)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn malformed_relay_key_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let issue = json!({ "payload": { "relayKey": "not-hex" } });
    let (status, body) = send(&router, post_json("/api/relay-tokens/issue", &issue)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad-request");
}

#[tokio::test]
async fn shared_secret_mode_requires_a_valid_signature() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.shared_secret = Some("edge-shared-secret".to_owned());
    let router = build_router(state_with(config).await);

    let payload = json!({ "relayKey": relay_key() });

    // Unsigned request is rejected.
    let (status, body) = send(
        &router,
        post_json("/api/relay-tokens/issue", &json!({ "payload": payload })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    // Correctly signed request passes.
    let ts = Utc::now().timestamp_millis();
    let signature = sign_request(b"edge-shared-secret", "public-web", &payload, ts);
    let request = Request::builder()
        .method("POST")
        .uri("/api/relay-tokens/issue")
        .header("content-type", "application/json")
        .header("x-hypertuna-timestamp", ts.to_string())
        .body(Body::from(
            json!({ "payload": payload, "signature": signature }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sequence"], 1);
}

#[tokio::test]
async fn debug_connections_is_hidden_without_admin_config() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let (status, _) = send(&router, get("/debug/connections")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn debug_connections_requires_the_admin_token() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.admin_token = Some("op-token".to_owned());
    let router = build_router(state_with(config).await);

    let (status, _) = send(&router, get("/debug/connections")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .uri("/debug/connections")
        .header("x-hypertuna-admin-token", "op-token")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn well_known_serves_fingerprint_not_secret() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.shared_secret = Some("hunter2".to_owned());
    config.shared_secret_version = 4;
    let router = build_router(state_with(config).await);

    let (status, body) = send(&router, get("/.well-known/hypertuna-gateway-secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["secretHash"],
        hypertuna_core::crypto::sha256_hex(b"hunter2")
    );
    assert_eq!(body["sharedSecretVersion"], 4);
    assert!(body.to_string().find("hunter2").is_none());
}

#[tokio::test]
async fn resolve_unknown_relay_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let (status, body) = send(&router, get(&format!("/api/relays/{}", relay_key()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not-found");
}

#[tokio::test]
async fn register_resolve_and_tunnel_rejection_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);
    let key = relay_key();

    // Worker registers with a valid proof of possession.
    let ts = Utc::now().timestamp_millis();
    let proof_body = json!({
        "relayKey": key,
        "ownerPubkey": "npub1owner",
        "name": "chat",
        "peerId": "peer-1",
        "peerEndpoint": "127.0.0.1:9400",
    });
    let signature = sign_request(b"worker-registration-secret", "peer-1", &proof_body, ts);
    let register = json!({
        "relayKey": key,
        "ownerPubkey": "npub1owner",
        "name": "chat",
        "peerId": "peer-1",
        "peerEndpoint": "127.0.0.1:9400",
        "authProof": { "tsMs": ts, "signature": signature },
    });
    let (status, body) = send(&router, post_json("/api/relays/register", &register)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["relayId"].as_str().is_some());

    // Resolution by owner:name works and reports the live peer.
    let (status, body) = send(&router, get("/api/relays/npub1owner:chat")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peers"].as_array().unwrap().len(), 1);

    // A bad registration proof is rejected.
    let forged = json!({
        "relayKey": key,
        "ownerPubkey": "npub1owner",
        "name": "chat",
        "peerId": "peer-2",
        "peerEndpoint": "127.0.0.1:9400",
        "authProof": { "tsMs": ts, "signature": "00".repeat(32) },
    });
    let (status, body) = send(&router, post_json("/api/relays/register", &forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn heartbeat_feeds_registry_and_dispatcher() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state_with(test_config(tmp.path())).await;
    let router = build_router(Arc::clone(&state));
    let key = relay_key();

    let ts = Utc::now().timestamp_millis();
    let proof_body = json!({
        "relayKey": key,
        "ownerPubkey": "npub1owner",
        "name": "chat",
        "peerId": "peer-1",
        "peerEndpoint": "127.0.0.1:9400",
    });
    let signature = sign_request(b"worker-registration-secret", "peer-1", &proof_body, ts);
    let register = json!({
        "relayKey": key,
        "ownerPubkey": "npub1owner",
        "name": "chat",
        "peerId": "peer-1",
        "peerEndpoint": "127.0.0.1:9400",
        "authProof": { "tsMs": ts, "signature": signature },
    });
    let (status, _) = send(&router, post_json("/api/relays/register", &register)).await;
    assert_eq!(status, StatusCode::OK);

    let heartbeat = json!({
        "peerId": "peer-1",
        "metrics": { "latencyMs": 12.5, "hyperbeeLag": 3 },
    });
    let (status, body) = send(&router, post_json("/api/peers/heartbeat", &heartbeat)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    // Unknown peers are reported, not errored.
    let heartbeat = json!({ "peerId": "ghost" });
    let (status, body) = send(&router, post_json("/api/peers/heartbeat", &heartbeat)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
}

#[tokio::test]
async fn blind_peer_status_reports_disabled_mirror() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let (status, body) = send(&router, get("/api/blind-peer")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let response = router
        .clone()
        .oneshot(get("/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("hypertuna_info"));
    assert!(text.contains("hypertuna_jobs_in_flight 0"));
}

#[tokio::test]
async fn websocket_route_requires_a_token() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state_with(test_config(tmp.path())).await);

    let (status, body) = send(&router, get("/relay")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}
