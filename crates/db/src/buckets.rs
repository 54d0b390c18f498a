// crates/db/src/buckets.rs
//! Week and month bucket identifiers.
//!
//! Bucket rows are append-only and keyed by their start instant, so
//! get-or-create is an insert that ignores conflicts followed by a lookup.
//! Concurrent resolvers of the same instant always agree on the id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc, Weekday};
use hudcache_core::{
    bucket_start, check_supported, parse_timestamp, Granularity, HandContext, HandId, MonthId,
    WeekId,
};

use crate::{Database, DbResult};

fn table(granularity: Granularity) -> (&'static str, &'static str) {
    match granularity {
        Granularity::Week => ("weeks", "week_start"),
        Granularity::Month => ("months", "month_start"),
    }
}

#[derive(Debug, Clone)]
pub struct TimeBucketResolver {
    db: Database,
    week_start: Weekday,
    cache: Arc<RwLock<HashMap<(Granularity, i64), i64>>>,
}

impl TimeBucketResolver {
    pub fn new(db: Database, week_start: Weekday) -> Self {
        Self {
            db,
            week_start,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn week_start(&self) -> Weekday {
        self.week_start
    }

    /// Id of the bucket containing `at`, creating the bucket if needed.
    pub async fn get_or_create(
        &self,
        at: DateTime<Utc>,
        granularity: Granularity,
    ) -> DbResult<i64> {
        let at = check_supported(at)?;
        let start = bucket_start(at, granularity, self.week_start).timestamp();

        if let Some(id) = self.cached(granularity, start) {
            return Ok(id);
        }

        let (table, column) = table(granularity);
        sqlx::query(&format!(
            "INSERT INTO {table} ({column}) VALUES (?) ON CONFLICT({column}) DO NOTHING"
        ))
        .bind(start)
        .execute(self.db.pool())
        .await?;
        let (id,): (i64,) = sqlx::query_as(&format!("SELECT id FROM {table} WHERE {column} = ?"))
            .bind(start)
            .fetch_one(self.db.pool())
            .await?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert((granularity, start), id);
        }
        tracing::trace!(granularity = granularity.as_str(), start, id, "resolved time bucket");
        Ok(id)
    }

    /// As [`get_or_create`](Self::get_or_create), from a raw importer
    /// timestamp. Missing or unparseable input is an error, never "now".
    pub async fn get_or_create_raw(
        &self,
        raw: Option<&str>,
        granularity: Granularity,
    ) -> DbResult<i64> {
        let at = parse_timestamp(raw)?;
        self.get_or_create(at, granularity).await
    }

    pub async fn resolve_pair(&self, at: DateTime<Utc>) -> DbResult<(WeekId, MonthId)> {
        let week = self.get_or_create(at, Granularity::Week).await?;
        let month = self.get_or_create(at, Granularity::Month).await?;
        Ok((week, month))
    }

    /// Key-derivation context for a hand. Buckets follow the hand's own
    /// start time.
    pub async fn context(
        &self,
        hand_id: HandId,
        start_time: DateTime<Utc>,
    ) -> DbResult<HandContext> {
        let (week_id, month_id) = self.resolve_pair(start_time).await?;
        Ok(HandContext {
            hand_id,
            start_time,
            week_id,
            month_id,
        })
    }

    /// Start instant of an existing bucket.
    pub async fn bucket_start_of(
        &self,
        id: i64,
        granularity: Granularity,
    ) -> DbResult<Option<DateTime<Utc>>> {
        let (table, column) = table(granularity);
        let row: Option<(i64,)> =
            sqlx::query_as(&format!("SELECT {column} FROM {table} WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.and_then(|(secs,)| DateTime::from_timestamp(secs, 0)))
    }

    fn cached(&self, granularity: Granularity, start: i64) -> Option<i64> {
        self.cache.read().ok()?.get(&(granularity, start)).copied()
    }
}
