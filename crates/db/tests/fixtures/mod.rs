//! Shared builders for rollup integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hudcache_core::{HandPlayerFact, ImportedHand, Position, RollupConfig, StyleMode};
use hudcache_db::{
    Database, DbResult, FactSource, RebuildEngine, RebuildFilter, RecordedFact, RollupEngine,
};

pub const GAMETYPE: i64 = 1;

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn config(style_mode: StyleMode) -> RollupConfig {
    RollupConfig {
        style_mode,
        lock_timeout_ms: 2_000,
        retry_backoff_ms: 5,
        ..Default::default()
    }
}

pub async fn memory_engine(style_mode: StyleMode) -> RollupEngine {
    let db = Database::new_in_memory().await.unwrap();
    RollupEngine::new(db, config(style_mode))
}

pub async fn file_engine(dir: &tempfile::TempDir, config: RollupConfig) -> RollupEngine {
    let db = Database::new(&dir.path().join("hudcache.db")).await.unwrap();
    RollupEngine::new(db, config)
}

/// A six-handed ring fact with one preflop decision.
pub fn fact(hand_id: i64, player_id: i64, position: char, voluntarily: bool) -> HandPlayerFact {
    let mut fact = HandPlayerFact::new(hand_id, player_id, GAMETYPE, 6, Position::new(position).unwrap());
    fact.stats.street0_vpi_chance = 1;
    fact.stats.street0_vpi = i64::from(voluntarily);
    fact.stats.committed = if voluntarily { 1.0 } else { 0.5 };
    fact.stats.total_profit = if voluntarily { 2.5 } else { -0.5 };
    fact
}

pub fn in_session(mut fact: HandPlayerFact, session_id: i64) -> HandPlayerFact {
    fact.session_id = Some(session_id);
    fact
}

pub fn in_tourney(mut fact: HandPlayerFact, tourney_id: i64, tourney_type_id: i64) -> HandPlayerFact {
    fact.tourney_id = Some(tourney_id);
    fact.tourney_type_id = Some(tourney_type_id);
    fact
}

pub fn hand(hand_id: i64, start_time: DateTime<Utc>, facts: Vec<HandPlayerFact>) -> ImportedHand {
    ImportedHand {
        hand_id,
        start_time,
        facts,
    }
}

/// `count` two-player hands between players 10 and 11, one hour apart.
pub fn heads_up_hands(first_id: i64, count: i64) -> Vec<ImportedHand> {
    (first_id..first_id + count)
        .map(|id| {
            hand(
                id,
                at(2024, 3, 1, 0) + chrono::Duration::hours(id),
                vec![fact(id, 10, 'B', id % 2 == 0), fact(id, 11, 'S', id % 3 == 0)],
            )
        })
        .collect()
}

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// The database's fact log, with `hook` run once right after the scan with
/// index `nth` (from zero) has read its chunk.
pub struct HookedFacts {
    db: Database,
    nth: usize,
    scans: AtomicUsize,
    hook: Mutex<Option<Hook>>,
}

impl HookedFacts {
    pub fn new<F, Fut>(db: Database, nth: usize, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Hook = Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(hook())
        });
        Self {
            db,
            nth,
            scans: AtomicUsize::new(0),
            hook: Mutex::new(Some(boxed)),
        }
    }
}

#[async_trait]
impl FactSource for HookedFacts {
    async fn scan_facts(
        &self,
        filter: &RebuildFilter,
        after: i64,
        limit: u32,
    ) -> DbResult<Vec<RecordedFact>> {
        let chunk = self.db.scan_facts(filter, after, limit).await?;
        if self.scans.fetch_add(1, Ordering::SeqCst) == self.nth {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook().await;
            }
        }
        Ok(chunk)
    }

    async fn fact_watermark(&self) -> DbResult<i64> {
        self.db.fact_watermark().await
    }

    async fn count_facts_after(&self, after: i64) -> DbResult<u64> {
        self.db.count_facts_after(after).await
    }

    async fn fact_revision(&self) -> DbResult<i64> {
        self.db.fact_revision().await
    }
}

/// A rebuild engine wired like `engine`'s, reading facts from `facts`.
pub fn rebuilds_over(engine: &RollupEngine, facts: Arc<dyn FactSource>) -> RebuildEngine {
    let config = engine.config();
    RebuildEngine::new(
        Arc::new(engine.db().clone()),
        facts,
        engine.buckets().clone(),
        engine.gate().clone(),
        config.style_mode,
        config.rebuild_chunk_size,
        config.money_tolerance,
    )
}
