//! Durable store for configuration, the warning ledger and the audit trail.
//!
//! SQLite through SQLx. Every repository call is retried once after a short
//! delay when the failure looks transient (busy database, pool timeout, I/O).

mod audit;
mod configs;
mod warnings;

pub use audit::AuditRepository;
pub use configs::ConfigRepository;
pub use warnings::{WarningFilter, WarningRepository};

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Delay before the single retry of a transient failure.
const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(sqlx::migrate::MigrateError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Sqlx(err)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

/// Errors worth one more attempt.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

/// Run `op`, retrying once after `RETRY_DELAY` when it fails transiently.
pub async fn retry_once<T, F, Fut>(op: F) -> Result<T, DbError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    match op().await {
        Err(DbError::Sqlx(e)) if is_transient(&e) => {
            warn!(error = %e, "transient database error; retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, DbError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::Corrupt(format!("timestamp out of range: {ms}")))
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open (or create) the database and apply migrations.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            // A uniquely named shared-cache database per call keeps parallel
            // tests apart.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:gatekeeper-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );

            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);

            // The database lives only as long as a connection does.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!(path = %parent.display(), error = %e, "failed to create database directory");
                    }
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(2));

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .connect_with(options)
                .await?
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::Migration)?;

        if path != ":memory:" {
            sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        }

        info!(path = %path, "database ready");
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub fn configs(&self) -> ConfigRepository<'_> {
        ConfigRepository::new(&self.pool)
    }

    pub fn warnings(&self) -> WarningRepository<'_> {
        WarningRepository::new(&self.pool)
    }

    pub fn audit(&self) -> AuditRepository<'_> {
        AuditRepository::new(&self.pool)
    }

    /// Close the pool; later queries fail with `PoolClosed`.
    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_in_memory_databases_are_isolated() {
        let a = Database::new(":memory:").await.unwrap();
        let b = Database::new(":memory:").await.unwrap();
        a.configs()
            .save("c1", &crate::security::SecurityConfig::default())
            .await
            .unwrap();
        assert!(a.configs().load("c1").await.unwrap().is_some());
        assert!(b.configs().load("c1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_once(|| async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_once_does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), DbError> = retry_once(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::NotFound("x".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(from_millis(to_millis(now)).unwrap(), now);
    }
}
