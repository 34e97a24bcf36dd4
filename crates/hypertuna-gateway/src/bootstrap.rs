//! State construction — turns a [`GatewayConfig`] into a wired [`AppState`].
//!
//! Lives outside `main.rs` so integration tests can build the same state
//! the binary runs with, against an in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::info;
use x25519_dalek::StaticSecret;

use hypertuna_core::dispatch::{Dispatcher, DispatcherConfig};
use hypertuna_core::escrow::{EscrowClient, EscrowClientConfig};
use hypertuna_core::mirror::{BlindPeerMirror, MirrorConfig};
use hypertuna_core::registry::{RegistryConfig, RelayRegistry};
use hypertuna_core::telemetry::MetricsRegistry;
use hypertuna_core::token::TokenService;
use hypertuna_core::vault::LeaseVault;
use hypertuna_storage::{MemoryBackend, StorageBackend};

use crate::config::{GatewayConfig, StorageBackendType};
use crate::connections::ConnectionTable;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Build the shared application state.
///
/// # Errors
///
/// Fails on unusable configuration: unreachable storage, malformed escrow
/// recipient secret, or a bad escrow client setup. These are startup
/// failures — the binary exits 1.
pub async fn build_state(config: GatewayConfig) -> anyhow::Result<Arc<AppState>> {
    // When the escrow store targets the same database as KV storage, it
    // rides the storage backend's pool instead of opening a second one.
    #[cfg(feature = "escrow-service")]
    #[allow(unused_mut)]
    let mut shared_kv_pool: Option<sqlx::PgPool> = None;

    let storage: Arc<dyn StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!(url = %"[redacted]", "using PostgreSQL storage");
            let backend = hypertuna_storage::PostgresBackend::connect(url)
                .await
                .context("failed to connect to PostgreSQL storage")?;
            #[cfg(feature = "escrow-service")]
            if config.escrow_database_url.as_deref() == Some(url.as_str()) {
                shared_kv_pool = Some(backend.pool().clone());
            }
            Arc::new(backend)
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("postgres storage requested but feature 'postgres-backend' is not enabled");
        }
    };

    let token_service = Arc::new(TokenService::new(Arc::clone(&storage)));

    let registry = Arc::new(RelayRegistry::new(
        RegistryConfig {
            peer_staleness_secs: config.peer_staleness_secs,
            registration_secret: config.registration_secret.as_bytes().to_vec(),
        },
        Arc::clone(&storage),
    ));
    registry
        .load()
        .await
        .context("failed to load relay registry")?;

    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
    let vault = Arc::new(LeaseVault::new());
    let metrics = Arc::new(MetricsRegistry::new());

    let mirror = Arc::new(BlindPeerMirror::new(
        MirrorConfig {
            enabled: config.mirror_enabled,
            storage_dir: config.mirror_storage_dir.clone(),
            trusted_peers_persist_path: config.trusted_peers_persist_path.clone(),
        },
        Arc::clone(&storage),
        Arc::clone(&metrics) as Arc<dyn hypertuna_core::telemetry::TelemetrySink>,
    ));

    let (escrow_client, escrow_recipient) = match &config.escrow {
        Some(settings) => {
            let secret_bytes: [u8; 32] = hex::decode(&settings.recipient_secret_hex)
                .ok()
                .and_then(|b| b.try_into().ok())
                .context("ESCROW_RECIPIENT_SECRET must be 32 bytes of hex")?;
            let recipient = StaticSecret::from(secret_bytes);

            let mut client_config = EscrowClientConfig::new(
                settings.base_url.clone(),
                settings.client_id.clone(),
                settings.signing_secret.as_bytes().to_vec(),
            );
            client_config.deadline = Duration::from_secs(10);
            let client =
                EscrowClient::new(client_config).context("failed to build escrow client")?;
            (Some(Arc::new(client)), Some(recipient))
        }
        None => (None, None),
    };

    #[cfg(feature = "escrow-service")]
    let escrow_pool = match &config.escrow_database_url {
        Some(url) => match shared_kv_pool {
            Some(pool) => {
                info!("escrow store sharing the gateway storage pool");
                crate::escrow_db::migrate(&pool)
                    .await
                    .context("failed to prepare escrow database")?;
                Some(pool)
            }
            None => Some(
                crate::escrow_db::connect(url)
                    .await
                    .context("failed to prepare escrow database")?,
            ),
        },
        None => None,
    };

    Ok(Arc::new(AppState {
        config,
        storage,
        token_service,
        registry,
        dispatcher,
        vault,
        escrow_client,
        escrow_recipient,
        mirror,
        metrics,
        connections: ConnectionTable::new(),
        token_rate_limiter: RateLimiter::default(),
        started_at: Utc::now(),
        #[cfg(feature = "escrow-service")]
        escrow_pool,
    }))
}
