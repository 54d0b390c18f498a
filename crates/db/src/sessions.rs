// crates/db/src/sessions.rs
//! Playing sessions: creation, bounds, and atomic reassignment.
//!
//! A session's week and month follow its start time. Reassigning a session
//! moves every hand, tournament and rollup row that references it onto
//! another session in one transaction, then removes the old session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hudcache_core::{KeyValue, MonthId, RollupTable, SessionId, StyleKey, WeekId};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use tracing::info;

use crate::buckets::TimeBucketResolver;
use crate::coordinator::RebuildGate;
use crate::port::Increment;
use crate::query::KeyFilter;
use crate::storage::{fetch_on, increment_on, insert_on};
use crate::{Database, DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub week_id: WeekId,
    pub month_id: MonthId,
}

/// Rows touched by a reassignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassignReport {
    pub hands: u64,
    pub tourneys: u64,
    pub session_rows: u64,
    pub hud_rows: u64,
    pub tourney_rows: u64,
}

fn timestamp(secs: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(DbError::InvalidTimestamp(
        hudcache_core::TimestampError::OutOfRange {
            input: secs.to_string(),
        },
    ))
}

#[derive(Debug, Clone)]
pub struct SessionAssigner {
    db: Database,
    buckets: TimeBucketResolver,
    gate: RebuildGate,
    lock_timeout: Duration,
}

impl SessionAssigner {
    pub fn new(
        db: Database,
        buckets: TimeBucketResolver,
        gate: RebuildGate,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            db,
            buckets,
            gate,
            lock_timeout,
        }
    }

    pub async fn create_session(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> DbResult<Session> {
        if start_time > end_time {
            return Err(DbError::InvalidSession {
                id: 0,
                reason: "start time is after end time",
            });
        }
        let (week_id, month_id) = self.buckets.resolve_pair(start_time).await?;
        let id = sqlx::query(
            "INSERT INTO sessions (start_time, end_time, week_id, month_id) VALUES (?, ?, ?, ?)",
        )
        .bind(start_time.timestamp())
        .bind(end_time.timestamp())
        .bind(week_id)
        .bind(month_id)
        .execute(self.db.pool())
        .await?
        .last_insert_rowid();
        self.get_session(id).await?.ok_or(DbError::UnknownSession(id))
    }

    pub async fn get_session(&self, id: SessionId) -> DbResult<Option<Session>> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT start_time, end_time, week_id, month_id FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|(start, end, week_id, month_id)| {
            Ok(Session {
                id,
                start_time: timestamp(start)?,
                end_time: timestamp(end)?,
                week_id,
                month_id,
            })
        })
        .transpose()
    }

    /// Widen the session's bounds to cover a hand played at `at`.
    pub async fn attach_hand(&self, id: SessionId, at: DateTime<Utc>) -> DbResult<Session> {
        let secs = at.timestamp();
        let updated = sqlx::query(
            "UPDATE sessions SET start_time = min(start_time, ?), end_time = max(end_time, ?) WHERE id = ?",
        )
        .bind(secs)
        .bind(secs)
        .bind(id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(DbError::UnknownSession(id));
        }
        let session = self.get_session(id).await?.ok_or(DbError::UnknownSession(id))?;
        self.merge_into_week_month(&session).await
    }

    /// Re-resolve the session's week and month from its start time.
    pub async fn merge_into_week_month(&self, session: &Session) -> DbResult<Session> {
        let (week_id, month_id) = self.buckets.resolve_pair(session.start_time).await?;
        if (week_id, month_id) == (session.week_id, session.month_id) {
            return Ok(session.clone());
        }
        sqlx::query("UPDATE sessions SET week_id = ?, month_id = ? WHERE id = ?")
            .bind(week_id)
            .bind(month_id)
            .bind(session.id)
            .execute(self.db.pool())
            .await?;
        Ok(Session {
            week_id,
            month_id,
            ..session.clone()
        })
    }

    /// Move everything that references session `from` onto session `to`.
    ///
    /// One transaction covers the hands, the tournaments, the SessionsCache
    /// and HudCache rows keyed by the session, the TourneysCache session
    /// attribute, the widened bounds of `to` and the deletion of `from`. On
    /// any failure nothing changes. The commit bumps the fact revision, so a
    /// rebuild that scanned the old assignment folds again.
    pub async fn reassign(&self, from: SessionId, to: SessionId) -> DbResult<ReassignReport> {
        if from == to {
            return Ok(ReassignReport::default());
        }
        let gate = self.gate.shared(self.lock_timeout).await?;

        let old = self.get_session(from).await?.ok_or(DbError::UnknownSession(from))?;
        let new = self.get_session(to).await?.ok_or(DbError::UnknownSession(to))?;
        let start_time = old.start_time.min(new.start_time);
        let end_time = old.end_time.max(new.end_time);
        let (week_id, month_id) = self.buckets.resolve_pair(start_time).await?;

        let mut tx = self.db.pool().begin().await?;
        let mut report = ReassignReport::default();

        report.hands = sqlx::query("UPDATE hands SET session_id = ? WHERE session_id = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.tourneys = sqlx::query("UPDATE tourneys SET session_id = ? WHERE session_id = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.tourney_rows =
            sqlx::query("UPDATE tourneys_cache SET session_id = ? WHERE session_id = ?")
                .bind(to)
                .bind(from)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        report.session_rows = rekey(
            &mut tx,
            RollupTable::Sessions,
            "session_id",
            KeyValue::Int(from),
            KeyValue::Int(to),
        )
        .await?;
        report.hud_rows = rekey(
            &mut tx,
            RollupTable::Hud,
            "style_key",
            StyleKey::Session(from).into(),
            StyleKey::Session(to).into(),
        )
        .await?;

        sqlx::query(
            "UPDATE sessions SET start_time = ?, end_time = ?, week_id = ?, month_id = ? WHERE id = ?",
        )
        .bind(start_time.timestamp())
        .bind(end_time.timestamp())
        .bind(week_id)
        .bind(month_id)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(from)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE fact_revision SET revision = revision + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        gate.release().await?;
        info!(
            from,
            to,
            hands = report.hands,
            session_rows = report.session_rows,
            hud_rows = report.hud_rows,
            "session reassigned"
        );
        Ok(report)
    }
}

/// Move every row of `table` whose `column` is `from` onto the key with
/// `column = to`, summing into rows that already exist there.
async fn rekey(
    conn: &mut SqliteConnection,
    table: RollupTable,
    column: &str,
    from: KeyValue,
    to: KeyValue,
) -> DbResult<u64> {
    let rows = fetch_on(conn, &KeyFilter::new(table).eq(column, from.clone())).await?;
    for stored in &rows {
        let moved = stored
            .key
            .with_value(column, to.clone())
            .ok_or_else(|| DbError::UnknownColumn {
                table,
                column: column.to_string(),
            })?;
        if increment_on(conn, &moved, &stored.row).await? == Increment::Missing {
            insert_on(conn, &moved, &stored.row).await?;
        }
    }
    let mut delete = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
        "DELETE FROM {} WHERE 1 = 1",
        table.table_name()
    ));
    crate::storage::push_conditions(&mut delete, &KeyFilter::new(table).eq(column, from));
    delete.build().execute(&mut *conn).await?;
    Ok(rows.len() as u64)
}
