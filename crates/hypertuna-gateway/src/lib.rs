//! Hypertuna gateway server library.
//!
//! Wires the core components into an Axum application: REST control plane,
//! the relay WebSocket tunnel, the escrow service, and the system routes.
//! The binary in `main.rs` adds signal handling, background workers, and
//! the ordered shutdown path.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

pub mod bootstrap;
pub mod config;
pub mod connections;
pub mod error;
#[cfg(feature = "escrow-service")]
pub mod escrow_db;
pub mod middleware;
pub mod peer_link;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod workers;
pub mod ws;

use state::AppState;

/// Build the Axum router with all routes and middleware.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-hypertuna-client-id"),
            axum::http::HeaderName::from_static("x-hypertuna-timestamp"),
        ]);

    // Token endpoints get a hard concurrency cap on top of the per-subject
    // rate limiter.
    let token_routes = routes::tokens::router()
        .layer(tower::limit::ConcurrencyLimitLayer::new(32));

    #[allow(unused_mut)]
    let mut app = Router::new()
        .merge(routes::sys::router())
        .merge(routes::blind_peer::router())
        .merge(ws::router())
        .nest("/api/relay-tokens", token_routes)
        .nest("/api/relays", routes::relays::router())
        .nest("/api/peers", routes::relays::peers_router());

    #[cfg(feature = "escrow-service")]
    {
        app = app.nest("/escrow", routes::escrow::router());
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
