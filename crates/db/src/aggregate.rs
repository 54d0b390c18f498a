// crates/db/src/aggregate.rs
//! Incremental application of facts onto rollup rows.
//!
//! The common case is a single atomic increment of an existing row. Only a
//! miss takes the insert coordinator, and the increment is retried under it
//! before inserting: another writer may have created the row meanwhile.

use std::sync::Arc;
use std::time::Duration;

use hudcache_core::{AggregateRow, DimensionKey, HandPlayerFact};

use crate::coordinator::{GateGuard, InsertCoordinator, RebuildGate};
use crate::port::{AggregatePort, Increment, StoredRow};
use crate::query::KeyFilter;
use crate::DbResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Incremented,
    Inserted,
}

#[derive(Clone)]
pub struct AggregateStore {
    port: Arc<dyn AggregatePort>,
    coordinator: Arc<InsertCoordinator>,
    gate: RebuildGate,
    lock_timeout: Duration,
}

impl AggregateStore {
    pub fn new(
        port: Arc<dyn AggregatePort>,
        coordinator: Arc<InsertCoordinator>,
        gate: RebuildGate,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            port,
            coordinator,
            gate,
            lock_timeout,
        }
    }

    pub fn coordinator(&self) -> &InsertCoordinator {
        &self.coordinator
    }

    /// Fold one fact into the row for `key` (the key names its table).
    pub async fn apply(&self, key: &DimensionKey, fact: &HandPlayerFact) -> DbResult<ApplyOutcome> {
        self.apply_batch(key, std::slice::from_ref(fact)).await
    }

    /// Fold several facts sharing one key in a single write. Every fact is
    /// validated before anything is written.
    pub async fn apply_batch(
        &self,
        key: &DimensionKey,
        facts: &[HandPlayerFact],
    ) -> DbResult<ApplyOutcome> {
        let mut delta = AggregateRow::default();
        for fact in facts {
            fact.validate()?;
            delta.merge(&AggregateRow::from_stats(&fact.stats));
        }
        let gate = self.gate.shared(self.lock_timeout).await?;
        let outcome = self.apply_row(&gate, key, &delta).await?;
        gate.release().await?;
        Ok(outcome)
    }

    /// Add `delta` to the row for `key`, creating it if needed. The caller
    /// already holds the rebuild gate.
    pub async fn apply_row(
        &self,
        _gate: &GateGuard<'_>,
        key: &DimensionKey,
        delta: &AggregateRow,
    ) -> DbResult<ApplyOutcome> {
        if self.port.increment(key, delta).await? == Increment::Applied {
            record_applied(key, delta);
            return Ok(ApplyOutcome::Incremented);
        }

        let lock = self.coordinator.acquire().await?;
        let outcome = match self.port.increment(key, delta).await {
            Ok(Increment::Applied) => Ok(ApplyOutcome::Incremented),
            Ok(Increment::Missing) => self
                .port
                .insert(key, delta)
                .await
                .map(|()| ApplyOutcome::Inserted),
            Err(e) => Err(e),
        };
        lock.release().await?;

        let outcome = outcome?;
        if outcome == ApplyOutcome::Inserted {
            tracing::debug!(table = %key.table, key = %key.describe(), "created rollup row");
        }
        record_applied(key, delta);
        Ok(outcome)
    }

    /// Increment-or-insert many rows in one transaction under the insert
    /// lock. Used by bulk ingestion.
    pub async fn write_rows(
        &self,
        _gate: &GateGuard<'_>,
        rows: &[(DimensionKey, AggregateRow)],
    ) -> DbResult<()> {
        let lock = self.coordinator.acquire().await?;
        let written = self.port.write_batch(rows).await;
        lock.release().await?;
        written?;
        for (key, delta) in rows {
            record_applied(key, delta);
        }
        Ok(())
    }

    pub async fn get(&self, key: &DimensionKey) -> DbResult<Option<AggregateRow>> {
        let mut filter = KeyFilter::new(key.table);
        for (column, value) in key.table.key_columns().iter().zip(&key.values) {
            filter = filter.eq(column.name, value.clone());
        }
        let rows = self.port.fetch(&filter).await?;
        Ok(rows.into_iter().next().map(|r| r.row))
    }

    pub async fn query(&self, filter: &KeyFilter) -> DbResult<Vec<StoredRow>> {
        self.port.fetch(filter).await
    }

    /// Sum of every row matching `filter`.
    pub async fn summarize(&self, filter: &KeyFilter) -> DbResult<AggregateRow> {
        let mut total = AggregateRow::default();
        for stored in self.port.fetch(filter).await? {
            total.merge(&stored.row);
        }
        Ok(total)
    }
}

fn record_applied(key: &DimensionKey, delta: &AggregateRow) {
    metrics::counter!("hudcache_facts_applied_total", "table" => key.table.table_name())
        .increment(delta.n.max(0) as u64);
}
