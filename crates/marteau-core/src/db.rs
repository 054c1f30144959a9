//! `SQLite` plumbing for the store shared by Marteau worker processes.
//!
//! Every process opens its own pool on the same database file. WAL mode and
//! a busy timeout let concurrent writers queue instead of failing.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

/// Store errors. This is the error every store operation surfaces; callers
/// treat anything but `NotFound` as fatal for the job at hand.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot prepare store location: {0}")]
    Io(String),

    #[error("Cannot connect to store: {0}")]
    Connection(String),

    #[error("Store migration failed: {0}")]
    Migration(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl DatabaseError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("Row".to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Pool tuning for a file-backed store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    /// How long a writer waits for another process's lock.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

fn connect_options(url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
    Ok(SqliteConnectOptions::from_str(url)
        .map_err(|e| DatabaseError::Connection(format!("{url}: {e}")))?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true))
}

/// Open the store at `path` with default tuning, creating the file and its
/// parent directory if needed.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    open_pool_with(path, &StoreOptions::default()).await
}

/// Open the store at `path`.
pub async fn open_pool_with(
    path: &Path,
    options: &StoreOptions,
) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::Io(format!("{}: {e}", parent.display())))?;
    }

    let connect = connect_options(&format!("sqlite:{}?mode=rwc", path.display()))?
        .busy_timeout(options.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect)
        .await
        .map_err(|e| DatabaseError::Connection(format!("{}: {e}", path.display())))?;

    info!(
        path = %path.display(),
        max_connections = options.max_connections,
        "Store opened"
    );
    Ok(pool)
}

/// Open a private in-memory store. A single connection, so every query sees
/// the same database.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options("sqlite::memory:")?)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    debug!("In-memory store opened");
    Ok(pool)
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Timestamp `ttl_secs` from now.
pub fn expiry_after(ttl_secs: i64) -> i64 {
    unix_timestamp().saturating_add(ttl_secs)
}

/// Define a store handle type around a `SQLite` pool.
///
/// ```ignore
/// marteau_core::define_database!(Database, "Worker store migrated");
/// ```
///
/// The handle is cheap to clone and applies the `migrations/` directory of
/// the invoking crate whenever it opens a pool.
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migrated:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Open the store file at `path`, creating it if missing.
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::from_pool($crate::db::open_pool(path).await?).await
            }

            /// Open the store file at `path` with explicit pool tuning.
            pub async fn open_with(
                path: &::std::path::Path,
                options: &$crate::db::StoreOptions,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::from_pool($crate::db::open_pool_with(path, options).await?).await
            }

            /// Open a private in-memory store.
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::from_pool($crate::db::open_pool_in_memory().await?).await
            }

            async fn from_pool(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::debug!($migrated);
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_relative_to_now() {
        let now = unix_timestamp();
        assert!(now > 1_704_067_200);
        let expiry = expiry_after(3600);
        assert!(expiry >= now + 3600 && expiry <= now + 3602);
        assert_eq!(expiry_after(i64::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn file_store_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let pool = open_pool_with(
            &path,
            &StoreOptions {
                max_connections: 2,
                busy_timeout: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();
        pool.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn in_memory_store_executes_queries() {
        let pool = open_pool_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(row.0, 1);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(DatabaseError::from(sqlx::Error::RowNotFound).is_not_found());
        assert!(!DatabaseError::Query("x".to_string()).is_not_found());
    }
}
