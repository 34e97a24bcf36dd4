//! Gateway configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Server settings use the `HYPERTUNA_*` prefix; escrow persistence and the
//! blind-peer status proxy keep their historical variable names.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the public HTTP/WS listener binds to.
    pub bind_addr: SocketAddr,
    /// Storage backend for token state and registrations.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// Shared secret for signed token endpoints. `None` disables signature
    /// checks (development).
    pub shared_secret: Option<String>,
    /// Version counter clients use to detect secret rotation.
    pub shared_secret_version: u32,
    /// Admin token gating `/debug/connections` and policy updates.
    pub admin_token: Option<String>,
    /// Shared secret worker peers sign registration proofs with.
    pub registration_secret: String,
    /// Heartbeats older than this make a peer stale (seconds).
    pub peer_staleness_secs: i64,
    /// How long to wait for in-flight tunnels on shutdown.
    pub drain_deadline: Duration,
    /// Dial timeout for the internal peer link.
    pub peer_dial_timeout: Duration,

    /// Escrow client settings; `None` disables lease brokering.
    pub escrow: Option<EscrowSettings>,
    /// Connection string for escrow persistence (`ESCROW_DATABASE_URL` or
    /// assembled from `POSTGRES_USER/PASSWORD/DB`).
    pub escrow_database_url: Option<String>,

    /// Blind-peer mirror settings.
    pub mirror_enabled: bool,
    pub mirror_storage_dir: PathBuf,
    pub trusted_peers_persist_path: PathBuf,
    /// External blind-peer status endpoint to proxy instead of the local
    /// mirror (`BLIND_PEER_STATUS_URL`).
    pub blind_peer_status_url: Option<String>,
    /// Default query shape for the status endpoint.
    pub blind_peer_status_detail: bool,
    pub blind_peer_status_owners: u32,
    pub blind_peer_status_cores_per_owner: u32,

    /// Discovery advertiser settings.
    pub discovery_enabled: bool,
    pub open_access: bool,
    pub public_url: String,
    pub ws_url: String,
    pub secret_url: String,
    pub display_name: String,
    pub region: String,
    pub discovery_bind_addr: SocketAddr,
    pub discovery_key_seed: Option<Vec<u8>>,
    pub discovery_refresh_interval: Duration,
    pub discovery_ttl_seconds: u64,
}

/// Escrow client settings.
#[derive(Debug, Clone)]
pub struct EscrowSettings {
    pub base_url: String,
    pub client_id: String,
    pub signing_secret: String,
    /// Hex-encoded 32-byte x25519 secret the gateway opens sealed writer
    /// keys with.
    pub recipient_secret_hex: String,
    /// Seconds between lease renewal/revocation reconciliation passes.
    pub reconcile_interval_secs: u64,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// PostgreSQL persistent storage.
    Postgres { url: String },
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds `0.0.0.0`)
    /// - `HYPERTUNA_BIND_ADDR` — full bind address (overrides `PORT`, default `127.0.0.1:8787`)
    /// - `HYPERTUNA_STORAGE` — `memory` or `postgres` (default `memory`)
    /// - `DATABASE_URL` — PostgreSQL connection string for the KV store
    /// - `HYPERTUNA_LOG_LEVEL` — log filter (default `info`)
    /// - `HYPERTUNA_SHARED_SECRET` / `HYPERTUNA_SHARED_SECRET_VERSION`
    /// - `HYPERTUNA_ADMIN_TOKEN` — admin gate for debug/policy endpoints
    /// - `HYPERTUNA_REGISTRATION_SECRET` — worker registration HMAC secret
    /// - `HYPERTUNA_PEER_STALENESS_SECS` (default `90`)
    /// - `HYPERTUNA_DRAIN_DEADLINE_SECS` (default `15`)
    /// - `ESCROW_BASE_URL`, `ESCROW_CLIENT_ID`, `ESCROW_SIGNING_SECRET`,
    ///   `ESCROW_RECIPIENT_SECRET` — escrow client (all four required to enable)
    /// - `ESCROW_DATABASE_URL` or `POSTGRES_USER`/`POSTGRES_PASSWORD`/`POSTGRES_DB`
    ///   — escrow persistence
    /// - `BLIND_PEER_ENABLED` (default `true`), `BLIND_PEER_STORAGE_DIR`,
    ///   `BLIND_PEER_TRUSTED_PEERS_PATH`
    /// - `BLIND_PEER_STATUS_URL`, `BLIND_PEER_STATUS_DETAIL`,
    ///   `BLIND_PEER_STATUS_OWNERS`, `BLIND_PEER_STATUS_CORES_PER_OWNER`
    /// - `HYPERTUNA_DISCOVERY_ENABLED`, `HYPERTUNA_OPEN_ACCESS`,
    ///   `HYPERTUNA_PUBLIC_URL`, `HYPERTUNA_WS_URL`, `HYPERTUNA_SECRET_URL`,
    ///   `HYPERTUNA_DISPLAY_NAME`, `HYPERTUNA_REGION`,
    ///   `HYPERTUNA_DISCOVERY_BIND_ADDR`, `HYPERTUNA_DISCOVERY_KEY_SEED`
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("HYPERTUNA_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8787)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8787);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8787))
        };

        let storage_backend = match std::env::var("HYPERTUNA_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => {
                let url = std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/hypertuna".to_owned());
                StorageBackendType::Postgres { url }
            }
            _ => StorageBackendType::Memory,
        };

        let escrow = match (
            std::env::var("ESCROW_BASE_URL"),
            std::env::var("ESCROW_CLIENT_ID"),
            std::env::var("ESCROW_SIGNING_SECRET"),
            std::env::var("ESCROW_RECIPIENT_SECRET"),
        ) {
            (Ok(base_url), Ok(client_id), Ok(signing_secret), Ok(recipient_secret_hex)) => {
                Some(EscrowSettings {
                    base_url,
                    client_id,
                    signing_secret,
                    recipient_secret_hex,
                    reconcile_interval_secs: env_parse("ESCROW_RECONCILE_INTERVAL_SECS", 30),
                })
            }
            _ => None,
        };

        let escrow_database_url = std::env::var("ESCROW_DATABASE_URL").ok().or_else(|| {
            let user = std::env::var("POSTGRES_USER").ok()?;
            let password = std::env::var("POSTGRES_PASSWORD").ok()?;
            let db = std::env::var("POSTGRES_DB").ok()?;
            let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_owned());
            Some(format!("postgres://{user}:{password}@{host}/{db}"))
        });

        Self {
            bind_addr,
            storage_backend,
            log_level: std::env::var("HYPERTUNA_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            shared_secret: std::env::var("HYPERTUNA_SHARED_SECRET").ok(),
            shared_secret_version: env_parse("HYPERTUNA_SHARED_SECRET_VERSION", 1),
            admin_token: std::env::var("HYPERTUNA_ADMIN_TOKEN").ok(),
            registration_secret: std::env::var("HYPERTUNA_REGISTRATION_SECRET")
                .unwrap_or_default(),
            peer_staleness_secs: env_parse("HYPERTUNA_PEER_STALENESS_SECS", 90),
            drain_deadline: Duration::from_secs(env_parse("HYPERTUNA_DRAIN_DEADLINE_SECS", 15)),
            peer_dial_timeout: Duration::from_secs(env_parse("HYPERTUNA_PEER_DIAL_TIMEOUT_SECS", 5)),
            escrow,
            escrow_database_url,
            mirror_enabled: env_flag("BLIND_PEER_ENABLED", true),
            mirror_storage_dir: PathBuf::from(
                std::env::var("BLIND_PEER_STORAGE_DIR")
                    .unwrap_or_else(|_| "./data/blind-peer".to_owned()),
            ),
            trusted_peers_persist_path: PathBuf::from(
                std::env::var("BLIND_PEER_TRUSTED_PEERS_PATH")
                    .unwrap_or_else(|_| "./data/trusted-peers.json".to_owned()),
            ),
            blind_peer_status_url: std::env::var("BLIND_PEER_STATUS_URL").ok(),
            blind_peer_status_detail: env_flag("BLIND_PEER_STATUS_DETAIL", false),
            blind_peer_status_owners: env_parse("BLIND_PEER_STATUS_OWNERS", 10),
            blind_peer_status_cores_per_owner: env_parse("BLIND_PEER_STATUS_CORES_PER_OWNER", 5),
            discovery_enabled: env_flag("HYPERTUNA_DISCOVERY_ENABLED", false),
            open_access: env_flag("HYPERTUNA_OPEN_ACCESS", false),
            public_url: std::env::var("HYPERTUNA_PUBLIC_URL").unwrap_or_default(),
            ws_url: std::env::var("HYPERTUNA_WS_URL").unwrap_or_default(),
            secret_url: std::env::var("HYPERTUNA_SECRET_URL").unwrap_or_default(),
            display_name: std::env::var("HYPERTUNA_DISPLAY_NAME").unwrap_or_default(),
            region: std::env::var("HYPERTUNA_REGION").unwrap_or_default(),
            discovery_bind_addr: std::env::var("HYPERTUNA_DISCOVERY_BIND_ADDR")
                .ok()
                .and_then(|a| a.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 49737))),
            discovery_key_seed: std::env::var("HYPERTUNA_DISCOVERY_KEY_SEED")
                .ok()
                .map(String::into_bytes),
            discovery_refresh_interval: Duration::from_secs(env_parse(
                "HYPERTUNA_DISCOVERY_REFRESH_SECS",
                30,
            )),
            discovery_ttl_seconds: env_parse("HYPERTUNA_DISCOVERY_TTL_SECS", 60),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}
