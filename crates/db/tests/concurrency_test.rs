//! Concurrent writers against one file-backed database.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::{at, config, fact, file_engine, hand, heads_up_hands, rebuilds_over, HookedFacts};
use chrono::Weekday;
use hudcache_core::{Granularity, LockMode, RollupConfig, RollupTable, StyleMode};
use hudcache_db::{Database, DbError, KeyFilter, RebuildOptions, RollupEngine, TimeBucketResolver};
use pretty_assertions::assert_eq;

async fn hud_total(engine: &RollupEngine, player_id: i64) -> (usize, i64) {
    let rows = engine
        .store()
        .query(&KeyFilter::new(RollupTable::Hud).player(player_id))
        .await
        .unwrap();
    (rows.len(), rows.iter().map(|r| r.row.n).sum())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_inserts_create_one_row() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = file_engine(&tmp, config(StyleMode::AllTime)).await;

    let tasks: Vec<_> = (1..=16)
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .ingest_hand(&hand(id, at(2024, 3, 15, 20), vec![fact(id, 10, 'B', true)]))
                    .await
            })
        })
        .collect();

    let mut inserted = 0;
    for task in tasks {
        inserted += task.await.unwrap().unwrap().rows_inserted;
    }

    // One Hud, one Cards and one Positions row, whoever got there first.
    assert_eq!(inserted, 3);
    assert_eq!(hud_total(&engine, 10).await, (1, 16));
    for table in [RollupTable::Cards, RollupTable::Positions] {
        let rows = engine.store().query(&KeyFilter::new(table)).await.unwrap();
        assert_eq!(rows.len(), 1, "{table}");
        assert_eq!(rows[0].row.n, 16, "{table}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bucket_creation_agrees_on_one_id() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::new(&tmp.path().join("buckets.db")).await.unwrap();

    // A fresh resolver per task, so no memo is shared between them.
    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let resolver = TimeBucketResolver::new(db.clone(), Weekday::Mon);
            tokio::spawn(async move {
                resolver
                    .get_or_create(at(2024, 3, 11 + i % 5, i), Granularity::Week)
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "{ids:?}");

    let (weeks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM weeks")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(weeks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_row_lock_serializes_two_writers() {
    let tmp = tempfile::tempdir().unwrap();
    let shared = RollupConfig {
        lock_mode: LockMode::StoreRow,
        ..config(StyleMode::AllTime)
    };
    // Two engines stand in for two importer processes.
    let a = file_engine(&tmp, shared.clone()).await;
    let b = file_engine(&tmp, shared).await;

    let batch_a = heads_up_hands(1, 10);
    let batch_b = heads_up_hands(11, 10);
    let (ra, rb) = tokio::join!(
        a.ingest_batch(&batch_a),
        b.ingest_batch(&batch_b),
    );
    ra.unwrap();
    rb.unwrap();

    assert_eq!(hud_total(&a, 10).await, (1, 20));
    assert_eq!(hud_total(&b, 11).await, (1, 20));
    a.rebuilds()
        .rebuild(RollupTable::Hud, &RebuildOptions::default(), |_| {})
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swap_excludes_writers_of_other_processes() {
    let tmp = tempfile::tempdir().unwrap();
    let shared = RollupConfig {
        lock_mode: LockMode::StoreRow,
        ..config(StyleMode::AllTime)
    };
    let a = file_engine(&tmp, shared.clone()).await;
    let b = file_engine(&tmp, shared).await;
    a.ingest_batch(&heads_up_hands(1, 1)).await.unwrap();

    // Scan 0 is the first phase; scan 1 is the catch-up under the gate. The
    // other importer starts right after it and gets time to finish if the
    // swap lets it in.
    let (sender, receiver) = tokio::sync::oneshot::channel();
    let late = heads_up_hands(2, 1);
    let facts = HookedFacts::new(a.db().clone(), 1, move || async move {
        let writer = tokio::spawn(async move { b.ingest_batch(&late).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = sender.send(writer);
    });
    rebuilds_over(&a, Arc::new(facts))
        .rebuild(RollupTable::Hud, &RebuildOptions::default(), |_| {})
        .await
        .unwrap();

    let writer = receiver.await.unwrap();
    assert_eq!(writer.await.unwrap().unwrap().hands_ingested, 1);
    assert_eq!(a.db().fact_count().await.unwrap(), 4);
    assert_eq!(hud_total(&a, 10).await, (1, 2));
    assert_eq!(hud_total(&a, 11).await, (1, 2));
    a.rebuild(RollupTable::Hud).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_during_ingestion_loses_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = file_engine(
        &tmp,
        RollupConfig {
            rebuild_chunk_size: 3,
            ..config(StyleMode::AllTime)
        },
    )
    .await;
    engine.ingest_batch(&heads_up_hands(1, 10)).await.unwrap();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for id in 11..=40 {
                engine
                    .ingest_batch(&heads_up_hands(id, 1))
                    .await
                    .unwrap();
            }
        })
    };
    let rebuilder = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                for table in [RollupTable::Hud, RollupTable::Positions] {
                    engine
                        .rebuilds()
                        .rebuild(table, &RebuildOptions::default(), |_| {})
                        .await
                        .unwrap();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    writer.await.unwrap();
    rebuilder.await.unwrap();

    assert_eq!(hud_total(&engine, 10).await.1, 40);
    for table in RollupTable::ALL {
        engine
            .rebuilds()
            .rebuild(table, &RebuildOptions::default(), |_| {})
            .await
            .unwrap_or_else(|e| panic!("{table}: {e}"));
    }
}

#[tokio::test]
async fn test_lock_wait_is_retried_until_released() {
    let db = hudcache_db::Database::new_in_memory().await.unwrap();
    let engine = RollupEngine::new(
        db,
        RollupConfig {
            lock_timeout_ms: 20,
            max_apply_retries: 20,
            retry_backoff_ms: 5,
            ..Default::default()
        },
    );

    let held = engine.store().coordinator().acquire().await.unwrap();
    let contended = hand(1, at(2024, 3, 15, 20), vec![fact(1, 10, 'B', true)]);
    let (ingested, released) = tokio::join!(
        engine.ingest_hand(&contended),
        async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            held.release().await
        },
    );
    released.unwrap();
    assert_eq!(ingested.unwrap().rows_inserted, 3);
}

#[tokio::test]
async fn test_exhausted_retries_leave_fact_for_rebuild() {
    let db = hudcache_db::Database::new_in_memory().await.unwrap();
    let engine = RollupEngine::new(
        db,
        RollupConfig {
            lock_timeout_ms: 10,
            max_apply_retries: 1,
            retry_backoff_ms: 1,
            ..Default::default()
        },
    );
    let first = hand(1, at(2024, 3, 15, 20), vec![fact(1, 10, 'B', true)]);

    let held = engine.store().coordinator().acquire().await.unwrap();
    let err = engine.ingest_hand(&first).await.unwrap_err();
    assert!(err.is_lock_timeout(), "{err:?}");
    held.release().await.unwrap();

    // Recorded once, so a retry of the import is a duplicate.
    assert_eq!(engine.db().fact_count().await.unwrap(), 1);
    let again = engine.ingest_batch(std::slice::from_ref(&first)).await.unwrap();
    assert_eq!(again.hands_rejected, 1);

    let err = engine
        .rebuilds()
        .rebuild(RollupTable::Hud, &RebuildOptions::default(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::RebuildInconsistency { .. }));
    assert_eq!(hud_total(&engine, 10).await, (1, 1));
}
