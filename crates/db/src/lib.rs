// crates/db/src/lib.rs
// SQLite persistence for the hand fact log and the rollup caches.
#![allow(clippy::too_many_arguments)]

pub mod aggregate;
pub mod buckets;
pub mod coordinator;
pub mod engine;
pub mod facts;
pub mod ingest;
mod migrations;
pub mod port;
pub mod query;
pub mod rebuild;
mod schema;
pub mod sessions;
mod storage;

pub use aggregate::{AggregateStore, ApplyOutcome};
pub use buckets::TimeBucketResolver;
pub use coordinator::{
    ExclusiveGuard, GateGuard, InsertCoordinator, InsertGuard, LockState, RebuildGate,
};
pub use engine::RollupEngine;
pub use facts::RecordedFact;
pub use ingest::{IngestReport, Rejection};
pub use port::{AggregatePort, FactSource, Increment, RollupMeta, StoredRow};
pub use query::{Condition, KeyFilter, RebuildFilter};
pub use rebuild::{
    RebuildEngine, RebuildOptions, RebuildPhase, RebuildProgress, RebuildReport, StalenessReport,
};
pub use sessions::{ReassignReport, Session, SessionAssigner};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use hudcache_core::{FactError, HandId, PlayerId, RollupTable, SessionId, TimestampError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("invalid fact: {0}")]
    InvalidFact(#[from] FactError),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampError),

    #[error("timed out after {waited:?} waiting for the {lock}")]
    LockTimeout { lock: &'static str, waited: Duration },

    #[error("key collision in {table}: {physical_key} stores [{stored}] but incoming key is [{incoming}]")]
    KeyCollision {
        table: RollupTable,
        physical_key: String,
        stored: String,
        incoming: String,
    },

    #[error(
        "rebuild of {} diverged from the incremental state on {} key(s)",
        .report.table,
        .report.divergent_keys.len()
    )]
    RebuildInconsistency { report: Box<RebuildReport> },

    #[error("rebuild of {table} was cancelled before commit")]
    RebuildCancelled { table: RollupTable },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("invalid session {id}: {reason}")]
    InvalidSession { id: SessionId, reason: &'static str },

    #[error("invalid filter for {table}: {reason}")]
    InvalidFilter {
        table: RollupTable,
        reason: &'static str,
    },

    #[error("{table} has no key column {column:?}")]
    UnknownColumn { table: RollupTable, column: String },

    #[error("stored fact for hand {hand_id} player {player_id} is unreadable: {source}")]
    CorruptFact {
        hand_id: HandId,
        player_id: PlayerId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DbError {
    /// Lock waits are the only errors the ingestion loop retries.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Main database handle wrapping a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn new(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
        };
        db.run_migrations().await?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses `shared_cache(true)` so all pool connections share the same
    /// in-memory database.
    pub async fn new_in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .shared_cache(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open the database at the default location: `~/.cache/hudcache/hudcache.db`
    pub async fn open_default() -> DbResult<Self> {
        let path = default_db_path()?;
        Self::new(&path).await
    }

    /// Run all inline migrations, then reconcile the generated rollup tables
    /// with the stat catalog.
    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1;
            if version > current_version {
                sqlx::query(migration).execute(&self.pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }

        self.ensure_rollup_tables().await?;
        Ok(())
    }

    /// Create every rollup table and add stat columns the catalog gained
    /// since the table was created. Added columns start at zero, so the
    /// table needs a rebuild before they mean anything.
    async fn ensure_rollup_tables(&self) -> DbResult<()> {
        for table in RollupTable::ALL {
            let name = table.table_name();
            let sql = schema::table_sql(table);
            sqlx::query(&sql.create).execute(&self.pool).await?;
            for index in &sql.indexes {
                sqlx::query(index).execute(&self.pool).await?;
            }

            let columns: Vec<(String,)> =
                sqlx::query_as(&format!("SELECT name FROM pragma_table_info('{}')", name))
                    .fetch_all(&self.pool)
                    .await?;
            for (column, typedef) in schema::stat_column_defs() {
                if !columns.iter().any(|(c,)| c == column) {
                    let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", name, column, typedef);
                    sqlx::query(&alter).execute(&self.pool).await?;
                    info!("Schema reconciliation: added {}.{}", name, column);
                }
            }
        }
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the path to the database file.
    /// Returns an empty path for in-memory databases.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Returns the default database path: `~/.cache/hudcache/hudcache.db`
pub fn default_db_path() -> DbResult<PathBuf> {
    hudcache_core::paths::db_path().ok_or(DbError::NoCacheDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_database() {
        let db = Database::new_in_memory()
            .await
            .expect("should create in-memory database");

        for table in ["hands", "hand_players", "sessions", "weeks", "months", "rollup_meta"] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap_or_else(|e| panic!("{table} should exist: {e}"));
            assert_eq!(count.0, 0, "{table}");
        }
        for table in RollupTable::ALL {
            let count: (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table.table_name()))
                    .fetch_one(db.pool())
                    .await
                    .expect("rollup table should exist");
            assert_eq!(count.0, 0);
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let db = Database::new_in_memory()
            .await
            .expect("first open should succeed");

        db.run_migrations()
            .await
            .expect("second migration run should succeed");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hud_cache")
            .fetch_one(db.pool())
            .await
            .expect("hud_cache should still exist");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_missing_stat_column_is_reconciled() {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query("ALTER TABLE cards_cache DROP COLUMN all_in_ev")
            .execute(db.pool())
            .await
            .unwrap();

        db.ensure_rollup_tables().await.unwrap();

        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info('cards_cache')")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(columns.iter().any(|(name,)| name == "all_in_ev"));
    }

    #[tokio::test]
    async fn test_file_based_database() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let db_path = tmp.path().join("nested").join("test.db");

        let db = Database::new(&db_path)
            .await
            .expect("should create file-based database");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hand_players")
            .fetch_one(db.pool())
            .await
            .expect("hand_players table should exist");
        assert_eq!(count.0, 0);

        assert!(db_path.exists(), "database file should be created on disk");
    }

    #[tokio::test]
    async fn test_default_db_path() {
        if let Ok(path) = default_db_path() {
            assert!(path.to_string_lossy().ends_with("hudcache.db"));
        }
    }
}
