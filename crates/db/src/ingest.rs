// crates/db/src/ingest.rs
//! Import-time orchestration: validate, record, derive keys, apply.
//!
//! A hand is recorded and applied while holding the rebuild gate in shared
//! mode, so a rebuild's swap never lands between the two. In store-row mode
//! that holds for writers in other processes as well.

use std::collections::BTreeMap;
use std::future::Future;

use hudcache_core::{
    check_supported, derive_keys, AggregateRow, DimensionKey, HandContext, HandId, ImportedHand,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregate::ApplyOutcome;
use crate::coordinator::GateGuard;
use crate::engine::RollupEngine;
use crate::{DbError, DbResult};

const MAX_BACKOFF_DOUBLINGS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub hand_id: HandId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub hands_ingested: u64,
    pub facts_applied: u64,
    pub rows_inserted: u64,
    pub hands_rejected: u64,
    pub facts_rejected: u64,
    pub rejections: Vec<Rejection>,
}

impl IngestReport {
    pub fn absorb(&mut self, other: IngestReport) {
        self.hands_ingested += other.hands_ingested;
        self.facts_applied += other.facts_applied;
        self.rows_inserted += other.rows_inserted;
        self.hands_rejected += other.hands_rejected;
        self.facts_rejected += other.facts_rejected;
        self.rejections.extend(other.rejections);
    }

    fn reject(&mut self, hand: &ImportedHand, error: &DbError) {
        warn!(hand_id = hand.hand_id, error = %error, "skipping invalid hand");
        self.hands_rejected += 1;
        self.facts_rejected += hand.facts.len() as u64;
        self.rejections.push(Rejection {
            hand_id: hand.hand_id,
            reason: error.to_string(),
        });
    }
}

/// Errors that reject one hand without stopping a batch.
fn is_rejection(error: &DbError) -> bool {
    matches!(
        error,
        DbError::InvalidFact(_) | DbError::InvalidTimestamp(_)
    )
}

impl RollupEngine {
    /// Retry `op` on lock timeouts with exponential backoff, up to the
    /// configured number of retries.
    async fn retry_on_lock<T, F, Fut>(&self, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_lock_timeout() && attempt < self.config.max_apply_retries => {
                    let backoff =
                        self.config.retry_backoff() * 2u32.pow(attempt.min(MAX_BACKOFF_DOUBLINGS));
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "lock wait timed out, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn shared_gate(&self) -> DbResult<GateGuard<'_>> {
        let timeout = self.config.lock_timeout();
        self.retry_on_lock(|| self.gate.shared(timeout)).await
    }

    /// Validate, then record the facts and widen the hand's session in one
    /// transaction. Buckets are resolved first: they are idempotent, and
    /// every recorded fact then has its week and month rows in place.
    async fn record(&self, hand: &ImportedHand) -> DbResult<HandContext> {
        hand.validate()?;
        check_supported(hand.start_time)?;
        let ctx = self.buckets.context(hand.hand_id, hand.start_time).await?;
        self.db.record_hand(hand, &ctx).await?;
        Ok(ctx)
    }

    /// Ingest one hand: every fact is recorded once and applied to every
    /// rollup it derives a key for.
    pub async fn ingest_hand(&self, hand: &ImportedHand) -> DbResult<IngestReport> {
        let gate = self.shared_gate().await?;
        let ctx = self.record(hand).await?;

        let mut report = IngestReport {
            hands_ingested: 1,
            ..Default::default()
        };
        for fact in &hand.facts {
            let delta = AggregateRow::from_stats(&fact.stats);
            for key in derive_keys(fact, &ctx, self.config.style_mode).dimensions() {
                let applied = self
                    .retry_on_lock(|| self.store.apply_row(&gate, &key, &delta))
                    .await;
                match applied {
                    Ok(ApplyOutcome::Inserted) => report.rows_inserted += 1,
                    Ok(ApplyOutcome::Incremented) => {}
                    Err(e) => {
                        error!(
                            hand_id = hand.hand_id,
                            player_id = fact.player_id,
                            table = %key.table,
                            error = %e,
                            "fact recorded but not applied; rebuild the table to recover"
                        );
                        return Err(e);
                    }
                }
            }
            report.facts_applied += 1;
        }
        gate.release().await?;
        Ok(report)
    }

    /// Ingest hands one by one. Invalid hands are logged and skipped;
    /// storage failures and exhausted lock retries stop the batch.
    pub async fn ingest_batch(&self, hands: &[ImportedHand]) -> DbResult<IngestReport> {
        let mut report = IngestReport::default();
        for hand in hands {
            match self.ingest_hand(hand).await {
                Ok(one) => report.absorb(one),
                Err(e) if is_rejection(&e) => report.reject(hand, &e),
                Err(e) => return Err(e),
            }
        }
        info!(
            hands = report.hands_ingested,
            facts = report.facts_applied,
            rows_inserted = report.rows_inserted,
            rejected = report.hands_rejected,
            "ingest batch complete"
        );
        Ok(report)
    }

    /// Record a batch of hands, fold their deltas in memory, and write every
    /// rollup in one transaction. Faster than [`ingest_batch`] for large
    /// imports; new rows are not counted individually.
    ///
    /// [`ingest_batch`]: Self::ingest_batch
    pub async fn ingest_bulk(&self, hands: &[ImportedHand]) -> DbResult<IngestReport> {
        let gate = self.shared_gate().await?;
        let mut report = IngestReport::default();
        let mut folded: BTreeMap<String, (DimensionKey, AggregateRow)> = BTreeMap::new();

        for hand in hands {
            let ctx = match self.record(hand).await {
                Ok(ctx) => ctx,
                Err(e) if is_rejection(&e) => {
                    report.reject(hand, &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for fact in &hand.facts {
                let delta = AggregateRow::from_stats(&fact.stats);
                for key in derive_keys(fact, &ctx, self.config.style_mode).dimensions() {
                    folded
                        .entry(key.physical_key())
                        .or_insert_with(|| (key, AggregateRow::default()))
                        .1
                        .merge(&delta);
                }
                report.facts_applied += 1;
            }
            report.hands_ingested += 1;
        }

        let rows: Vec<(DimensionKey, AggregateRow)> = folded.into_values().collect();
        if let Err(e) = self
            .retry_on_lock(|| self.store.write_rows(&gate, &rows))
            .await
        {
            error!(
                hands = report.hands_ingested,
                error = %e,
                "bulk facts recorded but not applied; rebuild every table to recover"
            );
            return Err(e);
        }
        gate.release().await?;
        info!(
            hands = report.hands_ingested,
            facts = report.facts_applied,
            rows = rows.len(),
            rejected = report.hands_rejected,
            "bulk ingest complete"
        );
        Ok(report)
    }
}
