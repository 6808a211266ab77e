//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `DatabasePool` pairs a
//! multi-connection reader pool for concurrent reads with a single-connection
//! writer pool, so batch workers checkpointing in parallel are serialized at
//! the pool instead of failing with `SQLITE_BUSY`.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::resolve_data_dir;

/// File name of the engine database inside the data directory.
pub const DATABASE_FILE: &str = "stagewright.db";

/// Failure opening the engine database.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to apply migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Create a new DatabasePool with split reader/writer connections.
    ///
    /// Runs migrations on the writer pool before the reader pool is opened.
    /// Both pools use WAL journal mode and a 5-second busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        let connect_err = |source| DatabaseError::Connect {
            url: database_url.to_string(),
            source,
        };
        let base_opts = SqliteConnectOptions::from_str(database_url)
            .map_err(connect_err)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await
            .map_err(connect_err)?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await
            .map_err(connect_err)?;

        tracing::debug!(url = database_url, "database pool opened");
        Ok(Self { reader, writer })
    }

    /// Open (creating if needed) `{data_dir}/stagewright.db`.
    pub async fn open(data_dir: &Path) -> Result<Self, DatabaseError> {
        Self::new(&database_url(data_dir)).await
    }

    /// Close both pools, waiting for in-flight queries.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// SQLite URL for the database inside `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

/// Database URL under the resolved data directory (`STAGEWRIGHT_DATA_DIR`,
/// falling back to `~/.stagewright`).
pub fn default_database_url() -> String {
    database_url(&resolve_data_dir())
}
