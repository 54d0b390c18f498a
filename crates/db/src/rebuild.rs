// crates/db/src/rebuild.rs
//! Full recomputation of a rollup table from the fact log.
//!
//! Phase one folds the log into memory without blocking writers. Phase two
//! takes the rebuild gate exclusively, folds the facts recorded since phase
//! one's watermark, and swaps the result in with one transaction. Until that
//! commit the live table is untouched, so a cancelled or failed rebuild
//! leaves it exactly as it was.
//!
//! Facts already folded can still change while phase one runs: reassigning
//! a session rewrites them in place. The fact log's revision is compared
//! across the phases, and phase two folds from the start when it moved.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hudcache_core::{derive_keys, AggregateRow, DimensionKey, RollupTable, StyleMode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buckets::TimeBucketResolver;
use crate::coordinator::RebuildGate;
use crate::port::{AggregatePort, FactSource, RollupMeta, StoredRow};
use crate::query::RebuildFilter;
use crate::{DbError, DbResult};

/// Divergent keys beyond this many are counted but not logged.
const LOGGED_DIVERGENCES: usize = 10;

#[derive(Debug, Clone)]
pub struct RebuildOptions {
    pub filter: RebuildFilter,
    /// Compare the recomputed rows with the live ones before swapping.
    pub verify: bool,
    pub cancel: CancellationToken,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            filter: RebuildFilter::all(),
            verify: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    Scanning,
    CatchingUp,
    Swapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildProgress {
    pub table: RollupTable,
    pub phase: RebuildPhase,
    pub facts_scanned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub table: RollupTable,
    pub filter: RebuildFilter,
    pub facts_scanned: u64,
    pub rows_before: u64,
    pub rows_after: u64,
    pub row_delta: i64,
    /// Physical keys whose recomputed row differs from the live one.
    pub divergent_keys: Vec<String>,
    pub fingerprint_before: String,
    pub fingerprint_after: String,
    pub fact_watermark: i64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalenessReport {
    pub table: RollupTable,
    pub last_rebuilt_at: Option<DateTime<Utc>>,
    pub rows: u64,
    pub facts_total: u64,
    /// Facts recorded after the last full rebuild's watermark.
    pub facts_since_rebuild: u64,
    /// `None` when there was no full rebuild to compare with.
    pub fingerprint_matches: Option<bool>,
    pub stale: bool,
}

/// blake3 over rows in physical-key order. Amounts are rounded to
/// micro-units so summation order does not change the digest.
pub fn fingerprint<'a>(rows: impl IntoIterator<Item = (&'a str, &'a AggregateRow)>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (physical_key, row) in rows {
        hasher.update(physical_key.as_bytes());
        hasher.update(&[0]);
        hasher.update(&row.n.to_le_bytes());
        for v in row.stats.counts() {
            hasher.update(&v.to_le_bytes());
        }
        for v in row.stats.amounts() {
            hasher.update(&((v * 1e6).round() as i64).to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

fn stored_fingerprint(rows: &[StoredRow]) -> String {
    fingerprint(rows.iter().map(|r| (r.physical_key.as_str(), &r.row)))
}

type Folded = BTreeMap<String, (DimensionKey, AggregateRow)>;

#[derive(Clone)]
pub struct RebuildEngine {
    port: Arc<dyn AggregatePort>,
    facts: Arc<dyn FactSource>,
    buckets: TimeBucketResolver,
    gate: RebuildGate,
    style_mode: StyleMode,
    chunk_size: u32,
    tolerance: f64,
}

impl RebuildEngine {
    pub fn new(
        port: Arc<dyn AggregatePort>,
        facts: Arc<dyn FactSource>,
        buckets: TimeBucketResolver,
        gate: RebuildGate,
        style_mode: StyleMode,
        chunk_size: u32,
        tolerance: f64,
    ) -> Self {
        Self {
            port,
            facts,
            buckets,
            gate,
            style_mode,
            chunk_size: chunk_size.max(1),
            tolerance,
        }
    }

    /// Recompute `table` (or the part `options.filter` selects) from facts.
    ///
    /// With `verify`, a mismatch between the recomputed and the live rows is
    /// logged and returned as `RebuildInconsistency` after the corrected rows
    /// have been committed.
    pub async fn rebuild(
        &self,
        table: RollupTable,
        options: &RebuildOptions,
        mut progress: impl FnMut(&RebuildProgress) + Send,
    ) -> DbResult<RebuildReport> {
        let started = Instant::now();
        options.filter.validate_for(table)?;
        let cancelled = || DbError::RebuildCancelled { table };

        let revision = self.facts.fact_revision().await?;
        let mut folded = Folded::new();
        let mut watermark = 0;
        let mut scanned = 0;
        self.fold_from(
            table,
            options,
            RebuildPhase::Scanning,
            &mut folded,
            &mut watermark,
            &mut scanned,
            &mut progress,
        )
        .await?;

        let gate = self
            .gate
            .exclusive(&options.cancel)
            .await?
            .ok_or_else(cancelled)?;
        if self.facts.fact_revision().await? != revision {
            info!(table = %table, "facts rewritten during the scan, folding from the start");
            folded.clear();
            watermark = 0;
            scanned = 0;
        }
        self.fold_from(
            table,
            options,
            RebuildPhase::CatchingUp,
            &mut folded,
            &mut watermark,
            &mut scanned,
            &mut progress,
        )
        .await?;
        if options.cancel.is_cancelled() {
            return Err(cancelled());
        }
        progress(&RebuildProgress {
            table,
            phase: RebuildPhase::Swapping,
            facts_scanned: scanned,
        });

        let live = self.port.fetch(&options.filter.key_filter(table)).await?;
        let divergent_keys = if options.verify {
            divergence(&live, &folded, self.tolerance)
        } else {
            Vec::new()
        };

        let fingerprint_after = fingerprint(folded.iter().map(|(k, (_, row))| (k.as_str(), row)));
        let rows: Vec<(DimensionKey, AggregateRow)> = folded.into_values().collect();
        let meta = options.filter.is_all().then(|| RollupMeta {
            table,
            rebuilt_at: Utc::now(),
            fact_watermark: watermark,
            row_count: rows.len() as u64,
            fingerprint: fingerprint_after.clone(),
        });
        let removed = self
            .port
            .replace(table, &options.filter, &rows, meta.as_ref())
            .await?;
        gate.release().await?;

        let report = RebuildReport {
            table,
            filter: options.filter.clone(),
            facts_scanned: scanned,
            rows_before: removed,
            rows_after: rows.len() as u64,
            row_delta: rows.len() as i64 - removed as i64,
            divergent_keys,
            fingerprint_before: stored_fingerprint(&live),
            fingerprint_after,
            fact_watermark: watermark,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        metrics::counter!("hudcache_rebuilds_total", "table" => table.table_name()).increment(1);

        if !report.divergent_keys.is_empty() {
            error!(
                table = %table,
                divergent = report.divergent_keys.len(),
                sample = ?&report.divergent_keys[..report.divergent_keys.len().min(LOGGED_DIVERGENCES)],
                "rebuild diverged from incremental state; corrected rows committed"
            );
            return Err(DbError::RebuildInconsistency {
                report: Box::new(report),
            });
        }
        info!(
            table = %table,
            facts = report.facts_scanned,
            rows = report.rows_after,
            row_delta = report.row_delta,
            elapsed_ms = report.elapsed_ms,
            "rebuild complete"
        );
        Ok(report)
    }

    /// Scan facts after `watermark` in chunks, folding each into `folded`.
    async fn fold_from(
        &self,
        table: RollupTable,
        options: &RebuildOptions,
        phase: RebuildPhase,
        folded: &mut Folded,
        watermark: &mut i64,
        scanned: &mut u64,
        progress: &mut (impl FnMut(&RebuildProgress) + Send),
    ) -> DbResult<()> {
        loop {
            if options.cancel.is_cancelled() {
                return Err(DbError::RebuildCancelled { table });
            }
            let chunk = self
                .facts
                .scan_facts(&options.filter, *watermark, self.chunk_size)
                .await?;
            let Some(last) = chunk.last() else {
                return Ok(());
            };
            *watermark = last.seq;

            for recorded in &chunk {
                let ctx = self
                    .buckets
                    .context(recorded.fact.hand_id, recorded.start_time)
                    .await?;
                let Some(key) = derive_keys(&recorded.fact, &ctx, self.style_mode).get(table)
                else {
                    continue;
                };
                folded
                    .entry(key.physical_key())
                    .or_insert_with(|| (key, AggregateRow::default()))
                    .1
                    .merge(&AggregateRow::from_stats(&recorded.fact.stats));
            }
            *scanned += chunk.len() as u64;
            progress(&RebuildProgress {
                table,
                phase,
                facts_scanned: *scanned,
            });
            if chunk.len() < self.chunk_size as usize {
                return Ok(());
            }
        }
    }

    /// Drop every row of one table. The next reads see an empty rollup
    /// until facts are applied or the table is rebuilt.
    pub async fn clear(&self, table: RollupTable) -> DbResult<u64> {
        let never = CancellationToken::new();
        let gate = self
            .gate
            .exclusive(&never)
            .await?
            .ok_or(DbError::RebuildCancelled { table })?;
        let removed = self
            .port
            .replace(table, &RebuildFilter::all(), &[], None)
            .await?;
        self.port.delete_meta(table).await?;
        gate.release().await?;
        warn!(table = %table, removed, "rollup table cleared");
        Ok(removed)
    }

    pub async fn staleness(&self, table: RollupTable) -> DbResult<StalenessReport> {
        let meta = self.port.read_meta(table).await?;
        let rows = self.port.count_rows(table).await?;
        let facts_total = self.facts.count_facts_after(0).await?;

        let (facts_since_rebuild, fingerprint_matches) = match &meta {
            Some(meta) => {
                let since = self.facts.count_facts_after(meta.fact_watermark).await?;
                let live = self
                    .port
                    .fetch(&RebuildFilter::all().key_filter(table))
                    .await?;
                (since, Some(stored_fingerprint(&live) == meta.fingerprint))
            }
            None => (facts_total, None),
        };
        let stale = match fingerprint_matches {
            None => facts_total > 0 || rows > 0,
            // Changed without new facts: something other than incremental
            // application touched the table.
            Some(matches) => !matches && facts_since_rebuild == 0,
        };

        Ok(StalenessReport {
            table,
            last_rebuilt_at: meta.map(|m| m.rebuilt_at),
            rows,
            facts_total,
            facts_since_rebuild,
            fingerprint_matches,
            stale,
        })
    }
}

/// Physical keys present on one side only, or whose rows differ.
fn divergence(live: &[StoredRow], folded: &Folded, tolerance: f64) -> Vec<String> {
    let mut divergent = Vec::new();
    let mut seen = HashSet::with_capacity(live.len());
    for stored in live {
        seen.insert(stored.physical_key.as_str());
        match folded.get(&stored.physical_key) {
            Some((_, rebuilt)) if stored.row.divergence(rebuilt, tolerance).is_empty() => {}
            _ => divergent.push(stored.physical_key.clone()),
        }
    }
    divergent.extend(
        folded
            .keys()
            .filter(|k| !seen.contains(k.as_str()))
            .cloned(),
    );
    divergent.sort();
    divergent
}

#[cfg(test)]
mod tests {
    use super::*;
    use hudcache_core::{KeyValue, StatLine};

    fn row(n: i64, profit: f64) -> AggregateRow {
        AggregateRow {
            n,
            stats: StatLine {
                total_profit: profit,
                ..Default::default()
            },
        }
    }

    fn key(player_id: i64) -> DimensionKey {
        DimensionKey::new(
            RollupTable::Sessions,
            vec![KeyValue::Int(1), KeyValue::Int(1), KeyValue::Int(player_id)],
        )
    }

    #[test]
    fn test_fingerprint_ignores_summation_noise() {
        let a = row(3, 0.1 + 0.2);
        let b = row(3, 0.3);
        assert_eq!(fingerprint([("k", &a)]), fingerprint([("k", &b)]));
        assert_ne!(fingerprint([("k", &a)]), fingerprint([("k", &row(4, 0.3))]));
        assert_ne!(fingerprint([("k", &a)]), fingerprint([("j", &a)]));
    }

    #[test]
    fn test_divergence_covers_both_sides() {
        let shared = key(1);
        let live_only = key(2);
        let rebuilt_only = key(3);
        let live = vec![
            StoredRow {
                physical_key: shared.physical_key(),
                key: shared.clone(),
                row: row(2, 1.0),
            },
            StoredRow {
                physical_key: live_only.physical_key(),
                key: live_only.clone(),
                row: row(1, 0.0),
            },
        ];
        let mut folded = Folded::new();
        folded.insert(shared.physical_key(), (shared.clone(), row(2, 1.0 + 1e-9)));
        folded.insert(rebuilt_only.physical_key(), (rebuilt_only.clone(), row(1, 0.0)));

        assert_eq!(
            divergence(&live, &folded, 1e-6),
            vec![live_only.physical_key(), rebuilt_only.physical_key()]
        );
    }
}
