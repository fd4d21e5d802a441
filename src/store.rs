//! Relational store owning all durable entity state.
//!
//! Every mutating operation is transactional; readers observe committed
//! state only. Caches elsewhere (topology graph, zone list) are rebuilt
//! from this source of truth and never override it.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub mod audit;
pub mod cnames;
pub mod domains;
pub mod health;
pub mod migrations;
pub mod models;
pub mod ports;
pub mod secrets;
pub mod topology;

const POOL_MAX_CONNECTIONS: u32 = 5;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: `{0}`")]
    Database(#[from] sqlx::Error),

    #[error("migration `{version}` failed: `{err}`")]
    Migration { version: i64, err: String },

    #[error("port range `{0}` has no free port")]
    PortExhausted(String),

    #[error("service `{service}` of project `{project}` already has an active allocation")]
    DuplicateService { project: String, service: String },

    #[error("{0} not found")]
    NotFound(String),
}

/// Handle over the connection pool. Cheap to clone; all consumers share
/// the same bounded pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database at `url`, creating the file when missing, and
    /// brings the schema up to date.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_pool_size(url, POOL_MAX_CONNECTIONS).await
    }

    /// In-memory database for tests. A single pooled connection, since
    /// every new `sqlite::memory:` connection would get its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect_with_pool_size("sqlite::memory:", 1).await
    }

    async fn connect_with_pool_size(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(url, "database ready");
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for (version, statements) in migrations::MIGRATIONS {
            let applied: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?1")
                    .bind(version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for statement in *statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| StoreError::Migration {
                        version: *version,
                        err: err.to_string(),
                    })?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
                .bind(version)
                .bind(chrono::Utc::now())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(version, "applied schema migration");
        }
        Ok(())
    }
}
