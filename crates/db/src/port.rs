// crates/db/src/port.rs
//! Storage seams used by the aggregate store and the rebuild engine.
//!
//! [`Database`](crate::Database) implements both traits; nothing above this
//! module issues rollup SQL directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hudcache_core::{AggregateRow, DimensionKey, RollupTable};
use serde::Serialize;

use crate::facts::RecordedFact;
use crate::query::{KeyFilter, RebuildFilter};
use crate::DbResult;

/// Result of a single-statement increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    Applied,
    /// No row exists for the key yet.
    Missing,
}

/// A rollup row as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub key: DimensionKey,
    pub physical_key: String,
    pub row: AggregateRow,
}

/// Written atomically with a full rebuild's swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupMeta {
    pub table: RollupTable,
    pub rebuilt_at: DateTime<Utc>,
    /// Highest fact sequence folded into the rebuild.
    pub fact_watermark: i64,
    pub row_count: u64,
    pub fingerprint: String,
}

#[async_trait]
pub trait AggregatePort: Send + Sync {
    /// Atomically add `delta` to the existing row for `key`. Fails with
    /// `KeyCollision` when the physical key is taken by different values.
    async fn increment(&self, key: &DimensionKey, delta: &AggregateRow) -> DbResult<Increment>;

    /// Insert a new row; the physical key is unique.
    async fn insert(&self, key: &DimensionKey, row: &AggregateRow) -> DbResult<()>;

    /// Increment-or-insert every row in one transaction.
    async fn write_batch(&self, rows: &[(DimensionKey, AggregateRow)]) -> DbResult<()>;

    /// Delete every row `scope` covers and insert `rows` in one transaction,
    /// optionally recording rebuild bookkeeping in the same commit.
    /// Returns the number of rows removed.
    async fn replace(
        &self,
        table: RollupTable,
        scope: &RebuildFilter,
        rows: &[(DimensionKey, AggregateRow)],
        meta: Option<&RollupMeta>,
    ) -> DbResult<u64>;

    async fn fetch(&self, filter: &KeyFilter) -> DbResult<Vec<StoredRow>>;

    async fn count_rows(&self, table: RollupTable) -> DbResult<u64>;

    async fn read_meta(&self, table: RollupTable) -> DbResult<Option<RollupMeta>>;

    async fn delete_meta(&self, table: RollupTable) -> DbResult<()>;
}

/// Ordered access to the recorded fact log.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Facts with `seq > after`, in sequence order.
    async fn scan_facts(
        &self,
        filter: &RebuildFilter,
        after: i64,
        limit: u32,
    ) -> DbResult<Vec<RecordedFact>>;

    /// Highest recorded sequence, 0 for an empty log.
    async fn fact_watermark(&self) -> DbResult<i64>;

    async fn count_facts_after(&self, after: i64) -> DbResult<u64>;

    /// Bumped by every in-place rewrite of recorded facts. Equal readings
    /// mean no fact seen between them changed.
    async fn fact_revision(&self) -> DbResult<i64>;
}
