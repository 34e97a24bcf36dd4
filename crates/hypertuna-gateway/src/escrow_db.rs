//! Escrow persistence — PostgreSQL schema and queries.
//!
//! Deposits hold sealed writer keys; leases record unlocks; revocations
//! feed the client-side release stream. Migrations are ordered
//! lexicographically by name and each applies in its own transaction,
//! recorded in `escrow_migrations` so reruns are no-ops.
//!
//! Every query is parameterized (sqlx) and takes a `&PgPool`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Deposit lifecycle states.
pub mod status {
    pub const DEPOSITED: &str = "deposited";
    pub const UNLOCKED: &str = "unlocked";
    pub const REVOKED: &str = "revoked";
    pub const EXPIRED: &str = "expired";
}

/// Errors from escrow persistence.
#[derive(Debug, thiserror::Error)]
pub enum EscrowDbError {
    /// A migration failed to apply.
    #[error("migration '{name}' failed: {reason}")]
    Migration { name: String, reason: String },

    /// The escrow id already exists.
    #[error("escrow id already deposited")]
    Duplicate,

    /// Any other database failure.
    #[error("escrow database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted deposit.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DepositRow {
    pub escrow_id: String,
    pub owner_peer_key: String,
    pub relay_key: String,
    pub sealed_payload: Value,
    pub recipient_public_key: String,
    pub policy: Value,
    pub deposited_at: DateTime<Utc>,
    pub status: String,
}

/// A persisted lease (the unlock record).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaseRow {
    pub lease_id: String,
    pub escrow_id: String,
    pub relay_key: String,
    pub requester_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub evidence: Value,
    pub payload_digest: String,
}

/// A persisted revocation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RevocationRow {
    pub escrow_id: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// Ordered migrations. Names sort lexicographically; never reorder or edit
/// an applied migration — append a new one.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_deposits",
        "CREATE TABLE IF NOT EXISTS escrow_deposits (\
            escrow_id            TEXT PRIMARY KEY, \
            owner_peer_key       TEXT NOT NULL, \
            relay_key            TEXT NOT NULL, \
            sealed_payload       JSONB NOT NULL, \
            recipient_public_key TEXT NOT NULL, \
            policy               JSONB NOT NULL, \
            deposited_at         TIMESTAMPTZ NOT NULL, \
            status               TEXT NOT NULL\
        ); \
        CREATE INDEX IF NOT EXISTS idx_escrow_deposits_relay \
            ON escrow_deposits (relay_key);",
    ),
    (
        "0002_leases",
        "CREATE TABLE IF NOT EXISTS escrow_leases (\
            lease_id       TEXT PRIMARY KEY, \
            escrow_id      TEXT NOT NULL REFERENCES escrow_deposits (escrow_id), \
            relay_key      TEXT NOT NULL, \
            requester_id   TEXT NOT NULL, \
            issued_at      TIMESTAMPTZ NOT NULL, \
            expires_at     TIMESTAMPTZ NOT NULL, \
            evidence       JSONB NOT NULL DEFAULT 'null'::jsonb, \
            payload_digest TEXT NOT NULL\
        ); \
        CREATE INDEX IF NOT EXISTS idx_escrow_leases_escrow \
            ON escrow_leases (escrow_id);",
    ),
    (
        "0003_revocations",
        "CREATE TABLE IF NOT EXISTS escrow_revocations (\
            escrow_id  TEXT PRIMARY KEY, \
            reason     TEXT NOT NULL, \
            revoked_at TIMESTAMPTZ NOT NULL\
        );",
    ),
];

/// Connect to the escrow database and apply pending migrations.
///
/// # Errors
///
/// Returns [`EscrowDbError`] if the connection or a migration fails.
pub async fn connect(database_url: &str) -> Result<PgPool, EscrowDbError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply pending migrations, each in its own transaction.
///
/// # Errors
///
/// Returns [`EscrowDbError::Migration`] naming the failed migration.
pub async fn migrate(pool: &PgPool) -> Result<(), EscrowDbError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS escrow_migrations (\
            name       TEXT PRIMARY KEY, \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\
        )",
    )
    .execute(pool)
    .await?;

    let mut ordered: Vec<&(&str, &str)> = MIGRATIONS.iter().collect();
    ordered.sort_by_key(|(name, _)| *name);

    for (name, sql) in ordered {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM escrow_migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| EscrowDbError::Migration {
                name: (*name).to_owned(),
                reason: e.to_string(),
            })?;
        sqlx::query("INSERT INTO escrow_migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(migration = %name, "escrow migration applied");
    }
    Ok(())
}

/// Insert a new deposit in the `deposited` state.
///
/// # Errors
///
/// Returns [`EscrowDbError::Duplicate`] when the escrow id already exists.
pub async fn insert_deposit(pool: &PgPool, row: &DepositRow) -> Result<(), EscrowDbError> {
    let result = sqlx::query(
        r"INSERT INTO escrow_deposits
          (escrow_id, owner_peer_key, relay_key, sealed_payload,
           recipient_public_key, policy, deposited_at, status)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&row.escrow_id)
    .bind(&row.owner_peer_key)
    .bind(&row.relay_key)
    .bind(&row.sealed_payload)
    .bind(&row.recipient_public_key)
    .bind(&row.policy)
    .bind(row.deposited_at)
    .bind(&row.status)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(EscrowDbError::Duplicate),
        Err(e) => Err(e.into()),
    }
}

/// Fetch a deposit by escrow id.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn get_deposit(
    pool: &PgPool,
    escrow_id: &str,
) -> Result<Option<DepositRow>, EscrowDbError> {
    let row = sqlx::query_as::<_, DepositRow>(
        "SELECT * FROM escrow_deposits WHERE escrow_id = $1",
    )
    .bind(escrow_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Move a deposit to a new status.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn set_deposit_status(
    pool: &PgPool,
    escrow_id: &str,
    new_status: &str,
) -> Result<(), EscrowDbError> {
    sqlx::query("UPDATE escrow_deposits SET status = $2 WHERE escrow_id = $1")
        .bind(escrow_id)
        .bind(new_status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a lease record for an unlocked deposit.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn insert_lease(pool: &PgPool, row: &LeaseRow) -> Result<(), EscrowDbError> {
    sqlx::query(
        r"INSERT INTO escrow_leases
          (lease_id, escrow_id, relay_key, requester_id, issued_at,
           expires_at, evidence, payload_digest)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&row.lease_id)
    .bind(&row.escrow_id)
    .bind(&row.relay_key)
    .bind(&row.requester_id)
    .bind(row.issued_at)
    .bind(row.expires_at)
    .bind(&row.evidence)
    .bind(&row.payload_digest)
    .execute(pool)
    .await?;
    Ok(())
}

/// All unexpired leases, newest first.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn list_active_leases(pool: &PgPool) -> Result<Vec<LeaseRow>, EscrowDbError> {
    let rows = sqlx::query_as::<_, LeaseRow>(
        "SELECT * FROM escrow_leases WHERE expires_at > now() ORDER BY issued_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record a revocation and flip the deposit's status, atomically.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn revoke_deposit(
    pool: &PgPool,
    escrow_id: &str,
    reason: &str,
) -> Result<(), EscrowDbError> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE escrow_deposits SET status = $2 WHERE escrow_id = $1")
        .bind(escrow_id)
        .bind(status::REVOKED)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r"INSERT INTO escrow_revocations (escrow_id, reason, revoked_at)
          VALUES ($1, $2, now())
          ON CONFLICT (escrow_id) DO NOTHING",
    )
    .bind(escrow_id)
    .bind(reason)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Revocations on or after `since`.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn list_revocations_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<RevocationRow>, EscrowDbError> {
    let rows = sqlx::query_as::<_, RevocationRow>(
        "SELECT * FROM escrow_revocations WHERE revoked_at >= $1 ORDER BY revoked_at",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Mark deposits with no unexpired lease and a `unlocked` status whose
/// leases are all past expiry as `expired`. Returns the number flipped.
///
/// # Errors
///
/// Returns [`EscrowDbError::Database`] on query failure.
pub async fn expire_stale_deposits(pool: &PgPool) -> Result<u64, EscrowDbError> {
    let result = sqlx::query(
        r"UPDATE escrow_deposits d SET status = $1
          WHERE d.status = $2
            AND NOT EXISTS (
                SELECT 1 FROM escrow_leases l
                WHERE l.escrow_id = d.escrow_id AND l.expires_at > now()
            )",
    )
    .bind(status::EXPIRED)
    .bind(status::UNLOCKED)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Smoke check: every migration's SQL parses as non-empty statements and
/// names stay unique and ordered. Useful without a live database.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_named_uniquely_and_in_order() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted, "migration names must be unique and sorted");
    }

    #[test]
    fn migration_sql_is_nonempty_and_idempotent_in_shape() {
        for (name, sql) in MIGRATIONS {
            assert!(!sql.trim().is_empty(), "{name} has empty SQL");
            assert!(
                sql.contains("IF NOT EXISTS"),
                "{name} must be rerunnable in shape"
            );
        }
    }

    #[test]
    fn status_vocabulary_matches_lifecycle() {
        assert_eq!(status::DEPOSITED, "deposited");
        assert_eq!(status::UNLOCKED, "unlocked");
        assert_eq!(status::REVOKED, "revoked");
        assert_eq!(status::EXPIRED, "expired");
    }
}
