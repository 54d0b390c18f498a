// crates/db/src/coordinator.rs
//! Serialization points for rollup writers.
//!
//! [`InsertCoordinator`] serializes first inserts of new keys. Increments
//! never need it. [`RebuildGate`] lets any number of incremental writers run
//! together while a rebuild's swap phase waits for all of them and then
//! excludes them. Session reassignment enters the gate as a writer.
//!
//! Lock order: gate before coordinator. A rebuild holds the gate exclusively
//! and never takes the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use hudcache_core::LockMode;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::{Database, DbError, DbResult};

const ROW_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

#[derive(Debug)]
pub struct InsertCoordinator {
    mode: LockMode,
    local: Mutex<()>,
    pool: SqlitePool,
    timeout: Duration,
    stale_after: Duration,
    holder: String,
}

impl InsertCoordinator {
    pub fn new(db: &Database, mode: LockMode, timeout: Duration, stale_after: Duration) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            mode,
            local: Mutex::new(()),
            pool: db.pool().clone(),
            timeout,
            stale_after,
            holder: format!("{}-{nanos}", std::process::id()),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether a writer in this process currently holds the lock.
    pub fn state(&self) -> LockState {
        match self.local.try_lock() {
            Ok(_) => LockState::Unlocked,
            Err(_) => LockState::Locked,
        }
    }

    /// Wait up to the configured timeout for exclusive first-insert rights.
    pub async fn acquire(&self) -> DbResult<InsertGuard<'_>> {
        let started = Instant::now();
        let local = tokio::time::timeout(self.timeout, self.local.lock())
            .await
            .map_err(|_| self.timed_out(started))?;

        let row = match self.mode {
            LockMode::InProcess => None,
            LockMode::StoreRow => Some(self.acquire_row(started).await?),
        };
        Ok(InsertGuard { _local: local, row })
    }

    async fn acquire_row(&self, started: Instant) -> DbResult<RowLock> {
        loop {
            let now = Utc::now().timestamp();
            let stale_before = now - self.stale_after.as_secs() as i64;
            let taken = sqlx::query(
                r#"UPDATE rollup_lock SET holder = ?, acquired_at = ?
                   WHERE id = 1 AND (holder IS NULL OR acquired_at < ?)"#,
            )
            .bind(&self.holder)
            .bind(now)
            .bind(stale_before)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if taken == 1 {
                return Ok(RowLock {
                    pool: self.pool.clone(),
                    holder: self.holder.clone(),
                });
            }
            if started.elapsed() >= self.timeout {
                return Err(self.timed_out(started));
            }
            tokio::time::sleep(ROW_POLL_INTERVAL).await;
        }
    }

    fn timed_out(&self, started: Instant) -> DbError {
        metrics::counter!("hudcache_lock_timeouts_total", "lock" => "insert").increment(1);
        DbError::LockTimeout {
            lock: "insert coordinator",
            waited: started.elapsed(),
        }
    }
}

#[derive(Debug)]
struct RowLock {
    pool: SqlitePool,
    holder: String,
}

impl RowLock {
    async fn release(self) -> DbResult<()> {
        sqlx::query("UPDATE rollup_lock SET holder = NULL, acquired_at = NULL WHERE id = 1 AND holder = ?")
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Held while inserting new keys. Call [`release`](Self::release); dropping
/// a store-row guard releases the row in the background.
#[derive(Debug)]
pub struct InsertGuard<'a> {
    _local: MutexGuard<'a, ()>,
    row: Option<RowLock>,
}

impl InsertGuard<'_> {
    pub async fn release(mut self) -> DbResult<()> {
        match self.row.take() {
            Some(row) => row.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for InsertGuard<'_> {
    fn drop(&mut self) {
        if let Some(row) = self.row.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = row.release().await {
                        tracing::warn!(error = %e, "failed to release insert lock row");
                    }
                });
            }
        }
    }
}

/// Shared by incremental writers, exclusive for a rebuild's swap.
///
/// In store-row mode the gate also lives in the database, so writers in
/// other processes are excluded too: a rebuild claims `rollup_swap` and then
/// waits for `rollup_writers` to drain, and a writer registers only while no
/// claim is held. Claims and registrations older than the stale window
/// belong to crashed processes and are ignored.
#[derive(Debug, Clone, Default)]
pub struct RebuildGate {
    inner: Arc<RwLock<()>>,
    store: Option<Arc<StoreGate>>,
}

#[derive(Debug)]
struct StoreGate {
    pool: SqlitePool,
    holder: String,
    next_writer: AtomicU64,
    stale_after: Duration,
}

impl StoreGate {
    fn stale_before(&self) -> i64 {
        Utc::now().timestamp() - self.stale_after.as_secs() as i64
    }

    async fn enter(&self, started: Instant, timeout: Duration) -> DbResult<GateRow> {
        let holder = format!(
            "{}-{}",
            self.holder,
            self.next_writer.fetch_add(1, Ordering::Relaxed)
        );
        loop {
            let entered = sqlx::query(
                r#"INSERT INTO rollup_writers (holder, entered_at)
                   SELECT ?, ? WHERE NOT EXISTS (
                       SELECT 1 FROM rollup_swap
                       WHERE id = 1 AND holder IS NOT NULL AND acquired_at >= ?)"#,
            )
            .bind(&holder)
            .bind(Utc::now().timestamp())
            .bind(self.stale_before())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if entered == 1 {
                return Ok(GateRow::Writer {
                    pool: self.pool.clone(),
                    holder,
                });
            }
            if started.elapsed() >= timeout {
                return Err(gate_timed_out(started));
            }
            tokio::time::sleep(ROW_POLL_INTERVAL).await;
        }
    }

    /// Claim the swap, then wait for registered writers to leave. `None`
    /// if `cancel` fires first; a claim already taken is given back.
    async fn claim(&self, cancel: &CancellationToken) -> DbResult<Option<GateRow>> {
        loop {
            let taken = sqlx::query(
                r#"UPDATE rollup_swap SET holder = ?, acquired_at = ?
                   WHERE id = 1 AND (holder IS NULL OR acquired_at < ?)"#,
            )
            .bind(&self.holder)
            .bind(Utc::now().timestamp())
            .bind(self.stale_before())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if taken == 1 {
                break;
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            tokio::time::sleep(ROW_POLL_INTERVAL).await;
        }
        let claim = GateRow::Swap {
            pool: self.pool.clone(),
            holder: self.holder.clone(),
        };

        loop {
            let stale_before = self.stale_before();
            sqlx::query("DELETE FROM rollup_writers WHERE entered_at < ?")
                .bind(stale_before)
                .execute(&self.pool)
                .await?;
            let (writers,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rollup_writers")
                .fetch_one(&self.pool)
                .await?;
            if writers == 0 {
                return Ok(Some(claim));
            }
            if cancel.is_cancelled() {
                claim.release().await?;
                return Ok(None);
            }
            tokio::time::sleep(ROW_POLL_INTERVAL).await;
        }
    }
}

#[derive(Debug)]
enum GateRow {
    Writer { pool: SqlitePool, holder: String },
    Swap { pool: SqlitePool, holder: String },
}

impl GateRow {
    async fn release(self) -> DbResult<()> {
        match self {
            GateRow::Writer { pool, holder } => {
                sqlx::query("DELETE FROM rollup_writers WHERE holder = ?")
                    .bind(holder)
                    .execute(&pool)
                    .await?;
            }
            GateRow::Swap { pool, holder } => {
                sqlx::query(
                    "UPDATE rollup_swap SET holder = NULL, acquired_at = NULL WHERE id = 1 AND holder = ?",
                )
                .bind(holder)
                .execute(&pool)
                .await?;
            }
        }
        Ok(())
    }

    fn release_in_background(self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = self.release().await {
                    tracing::warn!(error = %e, "failed to release rebuild gate row");
                }
            });
        }
    }
}

fn gate_timed_out(started: Instant) -> DbError {
    metrics::counter!("hudcache_lock_timeouts_total", "lock" => "rebuild_gate").increment(1);
    DbError::LockTimeout {
        lock: "rebuild gate",
        waited: started.elapsed(),
    }
}

/// Proof that the caller holds the gate in shared mode. Call
/// [`release`](Self::release); dropping a store-row guard releases its row
/// in the background.
#[derive(Debug)]
pub struct GateGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    row: Option<GateRow>,
}

impl GateGuard<'_> {
    pub async fn release(mut self) -> DbResult<()> {
        match self.row.take() {
            Some(row) => row.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if let Some(row) = self.row.take() {
            row.release_in_background();
        }
    }
}

/// Held for a rebuild's swap: no incremental writer is inside the gate.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    row: Option<GateRow>,
}

impl ExclusiveGuard<'_> {
    pub async fn release(mut self) -> DbResult<()> {
        match self.row.take() {
            Some(row) => row.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(row) = self.row.take() {
            row.release_in_background();
        }
    }
}

impl RebuildGate {
    /// A gate for writers of this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate shared with every process using `db` in store-row mode.
    pub fn store_row(db: &Database, stale_after: Duration) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            inner: Arc::default(),
            store: Some(Arc::new(StoreGate {
                pool: db.pool().clone(),
                holder: format!("{}-{nanos}", std::process::id()),
                next_writer: AtomicU64::new(0),
                stale_after,
            })),
        }
    }

    pub fn for_mode(db: &Database, mode: LockMode, stale_after: Duration) -> Self {
        match mode {
            LockMode::InProcess => Self::new(),
            LockMode::StoreRow => Self::store_row(db, stale_after),
        }
    }

    /// Enter as an incremental writer. Waits at most `timeout` for a
    /// rebuild's swap to finish.
    pub async fn shared(&self, timeout: Duration) -> DbResult<GateGuard<'_>> {
        let started = Instant::now();
        let guard = tokio::time::timeout(timeout, self.inner.read())
            .await
            .map_err(|_| gate_timed_out(started))?;
        let row = match &self.store {
            Some(store) => Some(store.enter(started, timeout).await?),
            None => None,
        };
        Ok(GateGuard {
            _guard: guard,
            row,
        })
    }

    /// Wait for every in-flight writer to leave, then exclude new ones.
    /// Returns `None` if `cancel` fires first.
    pub async fn exclusive(
        &self,
        cancel: &CancellationToken,
    ) -> DbResult<Option<ExclusiveGuard<'_>>> {
        let guard = tokio::select! {
            guard = self.inner.write() => guard,
            _ = cancel.cancelled() => return Ok(None),
        };
        let row = match &self.store {
            Some(store) => match store.claim(cancel).await? {
                Some(row) => Some(row),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(ExclusiveGuard {
            _guard: guard,
            row,
        }))
    }
}
