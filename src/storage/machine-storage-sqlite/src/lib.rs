//! # Machine Storage - SQLite Backend
//!
//! SQLite implementation of the storage backend.
//!
//! All plugin data lives in a single `kv_store` table. Expired rows are
//! filtered out of every read and physically removed by
//! [`SqliteBackend::purge_expired`], which runs on `init` and on `size`.
//!
//! ## Settings
//!
//! | Name | Default | Meaning |
//! |---|---|---|
//! | `SQLITE_PATH` | `machine-state.db` | database file, or `:memory:` |
//! | `SQLITE_MAX_CONNECTIONS` | `5` | pool size (forced to 1 for `:memory:`) |
//! | `SQLITE_WAL` | `false` | use write-ahead logging (file databases only) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{ConnectOptions, Connection};
use tokio::sync::{Mutex, OnceCell, SetError};
use tracing::{debug, info};

use machine_storage::{expires_in, validate_key, Settings, StorageBackend, StorageError};

/// Setting naming the database file.
pub const SETTING_PATH: &str = "SQLITE_PATH";

/// Setting bounding the connection pool.
pub const SETTING_MAX_CONNECTIONS: &str = "SQLITE_MAX_CONNECTIONS";

/// Setting enabling write-ahead logging.
pub const SETTING_WAL: &str = "SQLITE_WAL";

/// Database file used when `SQLITE_PATH` is not set.
pub const DEFAULT_PATH: &str = "machine-state.db";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const MEMORY_PATH: &str = ":memory:";

/// SQLite storage backend.
///
/// Construction only reads settings. The database is opened by
/// [`init`](StorageBackend::init); operations issued before that fail with
/// [`StorageError::NotInitialized`].
///
/// Each statement runs on its own pooled connection, so concurrent writes to
/// the same key resolve as last-writer-wins.
pub struct SqliteBackend {
    settings: Settings,
    db_path: Option<PathBuf>,
    max_connections: u32,
    wal: bool,
    pool: OnceCell<SqlitePool>,
    /// Holds an in-memory database open while pooled connections come and go.
    memory_keeper: Mutex<Option<SqliteConnection>>,
}

impl SqliteBackend {
    /// Creates a backend from settings without touching the disk.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSettings`] if a setting has the wrong
    /// type or the pool size is zero.
    pub fn new(settings: Settings) -> Result<Self, StorageError> {
        let path = settings.get_str(SETTING_PATH)?.unwrap_or(DEFAULT_PATH);
        if path.is_empty() {
            return Err(StorageError::InvalidSettings {
                key: SETTING_PATH.into(),
                reason: "path cannot be empty".into(),
            });
        }
        let db_path = (path != MEMORY_PATH).then(|| PathBuf::from(path));

        let max_connections = match settings.get_u64(SETTING_MAX_CONNECTIONS)? {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(0) => {
                return Err(StorageError::InvalidSettings {
                    key: SETTING_MAX_CONNECTIONS.into(),
                    reason: "must be at least 1".into(),
                })
            }
            Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
        };

        let wal = settings.get_bool(SETTING_WAL)?.unwrap_or(false);

        Ok(Self {
            settings,
            db_path,
            max_connections,
            wal,
            pool: OnceCell::new(),
            memory_keeper: Mutex::new(None),
        })
    }

    /// Creates and initializes a backend in one step.
    pub async fn open(settings: Settings) -> Result<Self, StorageError> {
        let backend = Self::new(settings)?;
        backend.init().await?;
        Ok(backend)
    }

    /// Returns the database file, or `None` for an in-memory database.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns true once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.pool.get().is_some_and(SqlitePool::is_closed)
    }

    /// Returns the live pool, or why there is none.
    fn pool(&self) -> Result<&SqlitePool, StorageError> {
        let pool = self.pool.get().ok_or(StorageError::NotInitialized)?;
        if pool.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(pool)
    }

    async fn connect(&self) -> Result<(SqlitePool, Option<SqliteConnection>), StorageError> {
        match &self.db_path {
            Some(db_path) => {
                if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
                    })?;
                }
                debug!(path = %db_path.display(), wal = self.wal, "Opening SQLite database");

                let mut options = SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true);
                if self.wal {
                    options = options.journal_mode(SqliteJournalMode::Wal);
                }

                let pool = SqlitePoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect_with(options)
                    .await
                    .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
                Ok((pool, None))
            }
            // An in-memory database lives only while a connection to it is
            // open, so one connection is kept outside the pool for its whole
            // lifetime. Connections built from the same options share it.
            None => {
                debug!("Opening in-memory SQLite database");

                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
                let keeper = options
                    .connect()
                    .await
                    .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>)
                    .connect_with(options)
                    .await
                    .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
                Ok((pool, Some(keeper)))
            }
        }
    }

    /// Runs database migrations.
    async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
        debug!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv_store (expires_at)")
            .execute(pool)
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;

        debug!("Migrations complete");

        Ok(())
    }

    /// Deletes every expired row and returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        let pool = self.pool()?;
        Self::purge_expired_in(pool).await
    }

    async fn purge_expired_in(pool: &SqlitePool) -> Result<u64, StorageError> {
        let purged =
            sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(Self::now())
                .execute(pool)
                .await
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?
                .rows_affected();

        if purged > 0 {
            debug!(purged, "Purged expired rows");
        }
        Ok(purged)
    }

    /// Returns the current Unix timestamp in milliseconds.
    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn init(&self) -> Result<(), StorageError> {
        if self.pool.initialized() {
            return Err(StorageError::AlreadyInitialized);
        }

        let (pool, keeper) = self.connect().await?;
        Self::migrate(&pool).await?;
        Self::purge_expired_in(&pool).await?;

        if let Err(err) = self.pool.set(pool) {
            // Lost a race with a concurrent init.
            let (SetError::AlreadyInitializedError(pool) | SetError::InitializingError(pool)) = err;
            pool.close().await;
            if let Some(keeper) = keeper {
                let _ = keeper.close().await;
            }
            return Err(StorageError::AlreadyInitialized);
        }
        *self.memory_keeper.lock().await = keeper;

        info!(path = ?self.db_path, "SQLite backend ready");

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;

        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Self::now())
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(row.map(|(v,)| v))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expires: Option<u64>,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let ttl = expires_in(expires)?;

        let now = Self::now();
        let expires_at = ttl.map(|ttl| {
            now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        });

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool()?)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        debug!(key = %key, len = value.len(), expires = ?expires, "Stored entry");

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;

        let deleted = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(self.pool()?)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?
            .rows_affected();

        if deleted > 0 {
            debug!(key = %key, "Deleted entry");
        }

        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Self::now())
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn size(&self) -> Result<u64, StorageError> {
        let pool = self.pool()?;
        Self::purge_expired_in(pool).await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(value)), 0) FROM kv_store",
        )
        .fetch_one(pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        Ok(u64::try_from(total).unwrap_or_default())
    }

    async fn close(&self) -> Result<(), StorageError> {
        match self.pool.get() {
            Some(pool) if !pool.is_closed() => {
                pool.close().await;
                info!(path = ?self.db_path, "SQLite backend closed");
            }
            _ => {}
        }

        if let Some(keeper) = self.memory_keeper.lock().await.take() {
            keeper
                .close()
                .await
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }
}
