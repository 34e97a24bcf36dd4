//! Gateway entry point.
//!
//! Bootstraps storage and every subsystem, starts the Axum edge with
//! graceful shutdown, and runs the background workers. Shutdown order:
//! stop accepting connections, drain in-flight tunnels up to the deadline,
//! destroy the lease vault, stop the mirror, stop the advertiser.
//!
//! Exit codes: 0 clean shutdown, 1 startup failure, 2 fatal runtime error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hypertuna_core::crypto::sha256_hex;
use hypertuna_core::discovery::{AdvertiserConfig, DiscoveryAdvertiser};
use hypertuna_core::registry::MirrorIdentity;

use hypertuna_gateway::bootstrap::build_state;
use hypertuna_gateway::config::GatewayConfig;
use hypertuna_gateway::state::AppState;
use hypertuna_gateway::{build_router, workers};

#[tokio::main]
async fn main() -> ExitCode {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "hypertuna gateway starting");

    let state = match build_state(config).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            return ExitCode::from(1);
        }
    };

    match run(state).await {
        Ok(()) => {
            info!("gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Blind-peer mirror: failures here disable the subsystem, never the
    // gateway.
    match state.mirror.initialize().await {
        Ok(()) => {
            if let Some(identity) = state.mirror.start().await.unwrap_or_else(|e| {
                warn!(error = %e, "mirror start failed; running without blind peer");
                None
            }) {
                let replication_topic =
                    sha256_hex(format!("{}:replication", identity.public_key).as_bytes());
                state
                    .registry
                    .set_mirror_identity(MirrorIdentity {
                        public_key: identity.public_key,
                        replication_topic,
                    })
                    .await;
            }
        }
        Err(e) => warn!(error = %e, "mirror initialization failed; running without blind peer"),
    }

    // Discovery advertiser.
    let advertiser = Arc::new(DiscoveryAdvertiser::new(advertiser_config(&state)));
    let advertiser_handle = if advertiser.active() {
        let advertiser = Arc::clone(&advertiser);
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = advertiser.run(rx).await {
                warn!(error = %e, "discovery advertiser stopped");
            }
        }))
    } else {
        info!("discovery advertising disabled (requires enabled + open access)");
        None
    };

    // Background workers.
    let reconcile_secs = state
        .config
        .escrow
        .as_ref()
        .map_or(30, |e| e.reconcile_interval_secs);
    let worker_handles = vec![
        tokio::spawn(workers::lease_maintenance_worker(
            Arc::clone(&state),
            shutdown_rx.clone(),
            reconcile_secs,
        )),
        tokio::spawn(workers::revocation_poll_worker(
            Arc::clone(&state),
            shutdown_rx.clone(),
            reconcile_secs,
        )),
        tokio::spawn(workers::stale_peer_worker(
            Arc::clone(&state),
            shutdown_rx.clone(),
            30,
        )),
    ];

    // Public edge.
    let listener = TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "gateway listening");

    let app = build_router(Arc::clone(&state));
    let server_tx = shutdown_tx.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(server_tx))
            .await
    });

    // Wait for the shutdown signal — or for the server to die on its own.
    let mut rx = shutdown_rx.clone();
    let early_exit = tokio::select! {
        _ = rx.changed() => None,
        joined = &mut server => Some(joined),
    };
    if let Some(joined) = early_exit {
        joined.context("server task panicked")?.context("server error")?;
        anyhow::bail!("server stopped before any shutdown signal");
    }

    // Drain in-flight tunnels up to the deadline.
    let deadline = Instant::now() + state.config.drain_deadline;
    while !state.connections.is_empty().await && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let remaining = state.connections.len().await;
    if remaining > 0 {
        warn!(remaining, "drain deadline reached with open tunnels");
    }

    // Ordered teardown: vault first, then mirror; the advertiser and
    // workers stop through the watch channel.
    state.vault.destroy("shutdown");
    state.mirror.stop().await;

    let server_result = tokio::time::timeout(Duration::from_secs(5), server).await;
    match server_result {
        Ok(joined) => joined.context("server task panicked")?.context("server error")?,
        Err(_) => warn!("server did not stop within 5s of drain"),
    }

    info!("waiting for background workers to stop");
    for handle in worker_handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    if let Some(handle) = advertiser_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    Ok(())
}

fn advertiser_config(state: &Arc<AppState>) -> AdvertiserConfig {
    let config = &state.config;
    AdvertiserConfig {
        enabled: config.discovery_enabled,
        open_access: config.open_access,
        public_url: config.public_url.clone(),
        ws_url: config.ws_url.clone(),
        secret_url: config.secret_url.clone(),
        display_name: config.display_name.clone(),
        region: config.region.clone(),
        shared_secret: config.shared_secret.clone(),
        shared_secret_version: config.shared_secret_version,
        key_seed: config.discovery_key_seed.clone(),
        refresh_interval: config.discovery_refresh_interval,
        ttl_seconds: config.discovery_ttl_seconds,
        bind_addr: config.discovery_bind_addr,
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping gateway");
    let _ = shutdown_tx.send(true);
}
