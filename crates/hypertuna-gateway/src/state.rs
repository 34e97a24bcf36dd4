//! Shared application state for the gateway edge.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the token service, relay registry,
//! dispatcher, lease vault, escrow client, blind-peer mirror, discovery
//! advertiser, metrics registry, and the live-connection table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use x25519_dalek::StaticSecret;

use hypertuna_core::dispatch::Dispatcher;
use hypertuna_core::escrow::EscrowClient;
use hypertuna_core::mirror::BlindPeerMirror;
use hypertuna_core::registry::RelayRegistry;
use hypertuna_core::telemetry::MetricsRegistry;
use hypertuna_core::token::TokenService;
use hypertuna_core::vault::LeaseVault;
use hypertuna_storage::StorageBackend;

use crate::config::GatewayConfig;
use crate::connections::ConnectionTable;
use crate::rate_limit::RateLimiter;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub storage: Arc<dyn StorageBackend>,
    pub token_service: Arc<TokenService>,
    pub registry: Arc<RelayRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub vault: Arc<LeaseVault>,
    /// Escrow client; `None` when lease brokering is not configured.
    pub escrow_client: Option<Arc<EscrowClient>>,
    /// Recipient secret for opening sealed writer keys.
    pub escrow_recipient: Option<StaticSecret>,
    pub mirror: Arc<BlindPeerMirror>,
    pub metrics: Arc<MetricsRegistry>,
    pub connections: ConnectionTable,
    pub token_rate_limiter: RateLimiter,
    pub started_at: DateTime<Utc>,
    /// Escrow persistence pool, when the in-repo escrow service is enabled.
    #[cfg(feature = "escrow-service")]
    pub escrow_pool: Option<sqlx::PgPool>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
