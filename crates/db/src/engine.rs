// crates/db/src/engine.rs
//! Wiring: one handle that owns every rollup component over a database.

use std::sync::Arc;

use hudcache_core::{RollupConfig, RollupTable};

use crate::aggregate::AggregateStore;
use crate::buckets::TimeBucketResolver;
use crate::coordinator::{InsertCoordinator, RebuildGate};
use crate::port::{AggregatePort, FactSource};
use crate::rebuild::{RebuildEngine, RebuildOptions, RebuildReport};
use crate::sessions::SessionAssigner;
use crate::{Database, DbError, DbResult};

/// Components share one rebuild gate and one insert coordinator, so every
/// writer in the process sees the same serialization points. In store-row
/// mode both also reach writers in other processes.
#[derive(Clone)]
pub struct RollupEngine {
    pub(crate) db: Database,
    pub(crate) config: Arc<RollupConfig>,
    pub(crate) gate: RebuildGate,
    pub(crate) buckets: TimeBucketResolver,
    pub(crate) store: AggregateStore,
    pub(crate) sessions: SessionAssigner,
    pub(crate) rebuilds: RebuildEngine,
}

impl RollupEngine {
    pub fn new(db: Database, config: RollupConfig) -> Self {
        let gate = RebuildGate::for_mode(&db, config.lock_mode, config.lock_stale_after());
        let buckets = TimeBucketResolver::new(db.clone(), config.week_start);
        let port: Arc<dyn AggregatePort> = Arc::new(db.clone());
        let facts: Arc<dyn FactSource> = Arc::new(db.clone());
        let coordinator = Arc::new(InsertCoordinator::new(
            &db,
            config.lock_mode,
            config.lock_timeout(),
            config.lock_stale_after(),
        ));

        let store = AggregateStore::new(
            port.clone(),
            coordinator,
            gate.clone(),
            config.lock_timeout(),
        );
        let sessions = SessionAssigner::new(
            db.clone(),
            buckets.clone(),
            gate.clone(),
            config.lock_timeout(),
        );
        let rebuilds = RebuildEngine::new(
            port,
            facts,
            buckets.clone(),
            gate.clone(),
            config.style_mode,
            config.rebuild_chunk_size,
            config.money_tolerance,
        );

        Self {
            db,
            config: Arc::new(config),
            gate,
            buckets,
            store,
            sessions,
            rebuilds,
        }
    }

    /// Open the configured database (or the default location).
    pub async fn open(config: RollupConfig) -> DbResult<Self> {
        let path = config.resolved_db_path().map_err(|_| DbError::NoCacheDir)?;
        let db = Database::new(&path).await?;
        Ok(Self::new(db, config))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    pub fn gate(&self) -> &RebuildGate {
        &self.gate
    }

    pub fn buckets(&self) -> &TimeBucketResolver {
        &self.buckets
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionAssigner {
        &self.sessions
    }

    pub fn rebuilds(&self) -> &RebuildEngine {
        &self.rebuilds
    }

    /// Full, verified rebuild of one table with no progress reporting.
    pub async fn rebuild(&self, table: RollupTable) -> DbResult<RebuildReport> {
        self.rebuilds
            .rebuild(table, &RebuildOptions::default(), |_| {})
            .await
    }
}
