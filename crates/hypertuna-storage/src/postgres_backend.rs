//! PostgreSQL storage backend.
//!
//! Stores all key-value data in a single `gateway_kv` table. Keys are UTF-8
//! strings, values are opaque bytes. Feature-gated behind `postgres-backend`.
//! Uses `sqlx` with the Tokio runtime for fully async operations.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{StorageBackend, StorageError};

/// A storage backend backed by PostgreSQL.
///
/// Thread-safe via `PgPool` (connection pool). All operations are fully async.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Connect to PostgreSQL and create the `gateway_kv` table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or table creation fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                path: "[postgres]".to_owned(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS gateway_kv (\
                key   TEXT  PRIMARY KEY, \
                value BYTEA NOT NULL\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[postgres]".to_owned(),
            reason: format!("table creation failed: {e}"),
        })?;

        // Prefix index for efficient list operations.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_gateway_kv_key_prefix \
             ON gateway_kv (key text_pattern_ops)",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: "[postgres]".to_owned(),
            reason: format!("index creation failed: {e}"),
        })?;

        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool, so co-located
    /// stores pointed at the same database can share it instead of opening
    /// a second pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM gateway_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO gateway_kv (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM gateway_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM gateway_kv WHERE key LIKE $1 ORDER BY key")
                .bind(pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::List {
                    prefix: prefix.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM gateway_kv WHERE key = $1)")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(row.map(|(e,)| e).unwrap_or(false))
    }
}
