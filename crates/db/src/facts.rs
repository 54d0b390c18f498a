// crates/db/src/facts.rs
//! The append-only hand fact log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hudcache_core::{
    FactError, HandContext, HandId, HandPlayerFact, ImportedHand, PlayerId, Position, StatLine,
};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::port::FactSource;
use crate::query::RebuildFilter;
use crate::{Database, DbError, DbResult};

/// A fact as read back from the log, together with its sequence number and
/// the hand's start time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedFact {
    pub seq: i64,
    pub start_time: DateTime<Utc>,
    pub fact: HandPlayerFact,
}

fn corrupt(
    hand_id: HandId,
    player_id: PlayerId,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> DbError {
    DbError::CorruptFact {
        hand_id,
        player_id,
        source: source.into(),
    }
}

fn decode_fact(row: &SqliteRow) -> DbResult<RecordedFact> {
    let hand_id: i64 = row.try_get("hand_id")?;
    let player_id: i64 = row.try_get("player_id")?;

    let position: String = row.try_get("position")?;
    let position = Position::try_from(position).map_err(|e| corrupt(hand_id, player_id, e))?;
    let stats: String = row.try_get("stats")?;
    let stats: StatLine =
        serde_json::from_str(&stats).map_err(|e| corrupt(hand_id, player_id, e))?;
    let seats = u8::try_from(row.try_get::<i64, _>("seats")?)
        .map_err(|e| corrupt(hand_id, player_id, e))?;
    let max_position = u8::try_from(row.try_get::<i64, _>("max_position")?)
        .map_err(|e| corrupt(hand_id, player_id, e))?;
    let start_cards = u16::try_from(row.try_get::<i64, _>("start_cards")?)
        .map_err(|e| corrupt(hand_id, player_id, e))?;
    let start_time = DateTime::from_timestamp(row.try_get("start_time")?, 0)
        .ok_or_else(|| corrupt(hand_id, player_id, "start time out of range"))?;

    Ok(RecordedFact {
        seq: row.try_get("seq")?,
        start_time,
        fact: HandPlayerFact {
            hand_id,
            player_id,
            gametype_id: row.try_get("gametype_id")?,
            tourney_id: row.try_get("tourney_id")?,
            tourney_type_id: row.try_get("tourney_type_id")?,
            session_id: row.try_get("session_id")?,
            seats,
            max_position,
            position,
            start_cards,
            stats,
        },
    })
}

impl Database {
    /// Record every fact of a validated hand in one transaction, widening
    /// the bounds of the hand's session in the same commit. `ctx` carries the
    /// hand's own week and month, which the session takes over when the hand
    /// moves its start earlier.
    ///
    /// A player already recorded for the hand is `AlreadyRecorded`; hand
    /// attributes that disagree with an earlier recording of the same hand
    /// are `InconsistentHand`; a session that does not exist is
    /// `UnknownSession`. In every case nothing of the hand is written.
    pub async fn record_hand(&self, hand: &ImportedHand, ctx: &HandContext) -> DbResult<()> {
        let first = hand.facts.first().ok_or(FactError::EmptyHand {
            hand_id: hand.hand_id,
        })?;
        let start_time = hand.start_time.timestamp();
        let recorded_at = Utc::now().timestamp();

        let mut tx = self.pool().begin().await?;

        if let Some(session_id) = first.session_id {
            // Right-hand sides see the row before the update.
            let widened = sqlx::query(
                r#"UPDATE sessions SET
                       week_id = CASE WHEN ? < start_time THEN ? ELSE week_id END,
                       month_id = CASE WHEN ? < start_time THEN ? ELSE month_id END,
                       start_time = min(start_time, ?),
                       end_time = max(end_time, ?)
                   WHERE id = ?"#,
            )
            .bind(start_time)
            .bind(ctx.week_id)
            .bind(start_time)
            .bind(ctx.month_id)
            .bind(start_time)
            .bind(start_time)
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if widened == 0 {
                return Err(FactError::UnknownSession {
                    hand_id: hand.hand_id,
                    session_id,
                }
                .into());
            }
        }

        if let (Some(tourney_id), Some(tourney_type_id)) = (first.tourney_id, first.tourney_type_id)
        {
            sqlx::query(
                "INSERT INTO tourneys (id, tourney_type_id, session_id) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
            )
            .bind(tourney_id)
            .bind(tourney_type_id)
            .bind(first.session_id)
            .execute(&mut *tx)
            .await?;
            let (stored_type,): (i64,) =
                sqlx::query_as("SELECT tourney_type_id FROM tourneys WHERE id = ?")
                    .bind(tourney_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if stored_type != tourney_type_id {
                return Err(FactError::InconsistentHand {
                    hand_id: hand.hand_id,
                    field: "tourney_type_id",
                }
                .into());
            }
        }

        sqlx::query(
            r#"INSERT INTO hands (id, start_time, gametype_id, tourney_id, session_id, seats)
               VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(hand.hand_id)
        .bind(start_time)
        .bind(first.gametype_id)
        .bind(first.tourney_id)
        .bind(first.session_id)
        .bind(i64::from(first.seats))
        .execute(&mut *tx)
        .await?;

        let stored: (i64, i64, Option<i64>, Option<i64>, i64) = sqlx::query_as(
            "SELECT start_time, gametype_id, tourney_id, session_id, seats FROM hands WHERE id = ?",
        )
        .bind(hand.hand_id)
        .fetch_one(&mut *tx)
        .await?;
        let mismatch = if stored.0 != start_time {
            Some("start_time")
        } else if stored.1 != first.gametype_id {
            Some("gametype_id")
        } else if stored.2 != first.tourney_id {
            Some("tourney_id")
        } else if stored.3 != first.session_id {
            Some("session_id")
        } else if stored.4 != i64::from(first.seats) {
            Some("seats")
        } else {
            None
        };
        if let Some(field) = mismatch {
            return Err(FactError::InconsistentHand {
                hand_id: hand.hand_id,
                field,
            }
            .into());
        }

        for fact in &hand.facts {
            let stats = serde_json::to_string(&fact.stats)
                .map_err(|e| corrupt(fact.hand_id, fact.player_id, e))?;
            let result = sqlx::query(
                r#"INSERT INTO hand_players
                   (hand_id, player_id, max_position, position, start_cards, stats, recorded_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(fact.hand_id)
            .bind(fact.player_id)
            .bind(i64::from(fact.max_position))
            .bind(fact.position.to_string())
            .bind(i64::from(fact.start_cards))
            .bind(stats)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await;
            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Err(FactError::AlreadyRecorded {
                        hand_id: fact.hand_id,
                        player_id: fact.player_id,
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Number of recorded player facts.
    pub async fn fact_count(&self) -> DbResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hand_players")
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl FactSource for Database {
    async fn scan_facts(
        &self,
        filter: &RebuildFilter,
        after: i64,
        limit: u32,
    ) -> DbResult<Vec<RecordedFact>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"SELECT hp.seq, hp.hand_id, hp.player_id, hp.max_position, hp.position,
                      hp.start_cards, hp.stats, h.start_time, h.gametype_id, h.tourney_id,
                      h.session_id, h.seats, t.tourney_type_id
               FROM hand_players hp
               JOIN hands h ON h.id = hp.hand_id
               LEFT JOIN tourneys t ON t.id = h.tourney_id
               WHERE hp.seq > "#,
        );
        qb.push_bind(after);
        if !filter.players.is_empty() {
            qb.push(" AND hp.player_id IN (");
            let mut separated = qb.separated(", ");
            for player in &filter.players {
                separated.push_bind(*player);
            }
            separated.push_unseparated(")");
        }
        if !filter.gametypes.is_empty() {
            qb.push(" AND h.gametype_id IN (");
            let mut separated = qb.separated(", ");
            for gametype in &filter.gametypes {
                separated.push_bind(*gametype);
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY hp.seq LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.iter().map(decode_fact).collect()
    }

    async fn fact_watermark(&self) -> DbResult<i64> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM hand_players")
            .fetch_one(self.pool())
            .await?;
        Ok(seq)
    }

    async fn count_facts_after(&self, after: i64) -> DbResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hand_players WHERE seq > ?")
            .bind(after)
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }

    async fn fact_revision(&self) -> DbResult<i64> {
        let (revision,): (i64,) = sqlx::query_as("SELECT revision FROM fact_revision WHERE id = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn hand(hand_id: i64, players: &[i64]) -> ImportedHand {
        let facts = players
            .iter()
            .enumerate()
            .map(|(i, player)| {
                let position = Position::new(char::from(b'0' + i as u8)).unwrap();
                let mut fact = HandPlayerFact::new(hand_id, *player, 5, 6, position);
                fact.stats.street0_vpi_chance = 1;
                fact.stats.total_profit = -0.5;
                fact
            })
            .collect();
        ImportedHand {
            hand_id,
            start_time: Utc.with_ymd_and_hms(2024, 3, 15, 20, 0, 0).unwrap(),
            facts,
        }
    }

    async fn record(db: &Database, hand: &ImportedHand) -> DbResult<()> {
        let ctx = HandContext {
            hand_id: hand.hand_id,
            start_time: hand.start_time,
            week_id: 1,
            month_id: 1,
        };
        db.record_hand(hand, &ctx).await
    }

    async fn session_row(db: &Database, id: i64) -> Option<(i64, i64, i64, i64)> {
        sqlx::query_as("SELECT start_time, end_time, week_id, month_id FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_and_scan_in_sequence_order() {
        let db = Database::new_in_memory().await.unwrap();
        record(&db, &hand(1, &[10, 11])).await.unwrap();
        record(&db, &hand(2, &[10])).await.unwrap();

        let facts = db.scan_facts(&RebuildFilter::all(), 0, 100).await.unwrap();
        let seen: Vec<(i64, i64)> = facts
            .iter()
            .map(|r| (r.fact.hand_id, r.fact.player_id))
            .collect();
        assert_eq!(seen, vec![(1, 10), (1, 11), (2, 10)]);
        assert_eq!(facts[0].fact, hand(1, &[10, 11]).facts[0]);
        assert_eq!(db.fact_watermark().await.unwrap(), facts[2].seq);

        let tail = db.scan_facts(&RebuildFilter::all(), facts[0].seq, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, facts[1].seq);
    }

    #[tokio::test]
    async fn test_scan_respects_player_filter() {
        let db = Database::new_in_memory().await.unwrap();
        record(&db, &hand(1, &[10, 11])).await.unwrap();
        let facts = db
            .scan_facts(&RebuildFilter::players(vec![11]), 0, 100)
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].fact.player_id, 11);
    }

    #[tokio::test]
    async fn test_duplicate_fact_is_rejected_without_partial_write() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(&tmp.path().join("facts.db")).await.unwrap();
        record(&db, &hand(1, &[10])).await.unwrap();

        let err = record(&db, &hand(1, &[12, 10])).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidFact(FactError::AlreadyRecorded {
                hand_id: 1,
                player_id: 10
            })
        ));
        assert_eq!(db.fact_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rerecording_hand_with_other_attributes_is_inconsistent() {
        let db = Database::new_in_memory().await.unwrap();
        record(&db, &hand(1, &[10])).await.unwrap();

        let mut late = hand(1, &[11]);
        late.facts[0].gametype_id = 9;
        let err = record(&db, &late).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidFact(FactError::InconsistentHand {
                field: "gametype_id",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_tourney_type_comes_from_tourney_table() {
        let db = Database::new_in_memory().await.unwrap();
        let mut h = hand(3, &[10]);
        h.facts[0].tourney_id = Some(70);
        h.facts[0].tourney_type_id = Some(2);
        record(&db, &h).await.unwrap();

        let facts = db.scan_facts(&RebuildFilter::all(), 0, 10).await.unwrap();
        assert_eq!(facts[0].fact.tourney_id, Some(70));
        assert_eq!(facts[0].fact.tourney_type_id, Some(2));
        assert_eq!(db.count_facts_after(0).await.unwrap(), 1);
        assert_eq!(db.count_facts_after(facts[0].seq).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_bounds_commit_with_the_facts() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(&tmp.path().join("bounds.db")).await.unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 3, 15, 20, 0, 0).unwrap().timestamp();
        for sql in [
            "INSERT INTO weeks (id, week_start) VALUES (1, 100), (2, 200)",
            "INSERT INTO months (id, month_start) VALUES (1, 100), (2, 200)",
        ] {
            sqlx::query(sql).execute(db.pool()).await.unwrap();
        }
        sqlx::query("INSERT INTO sessions (id, start_time, end_time, week_id, month_id) VALUES (4, ?, ?, 1, 1)")
            .bind(evening)
            .bind(evening)
            .execute(db.pool())
            .await
            .unwrap();

        let mut earlier = hand(2, &[10, 10]);
        earlier.start_time = Utc.with_ymd_and_hms(2024, 3, 15, 18, 0, 0).unwrap();
        for fact in &mut earlier.facts {
            fact.session_id = Some(4);
        }
        let ctx = HandContext {
            hand_id: 2,
            start_time: earlier.start_time,
            week_id: 2,
            month_id: 2,
        };

        // The second fact collides with the first: the widened bounds go too.
        let err = db.record_hand(&earlier, &ctx).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidFact(FactError::AlreadyRecorded { .. })));
        assert_eq!(session_row(&db, 4).await, Some((evening, evening, 1, 1)));
        assert_eq!(db.fact_count().await.unwrap(), 0);

        earlier.facts.truncate(1);
        db.record_hand(&earlier, &ctx).await.unwrap();
        let start = earlier.start_time.timestamp();
        assert_eq!(session_row(&db, 4).await, Some((start, evening, 2, 2)));

        let mut orphan = hand(3, &[10]);
        orphan.facts[0].session_id = Some(9);
        let err = record(&db, &orphan).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidFact(FactError::UnknownSession {
                hand_id: 3,
                session_id: 9
            })
        ));
        assert_eq!(db.fact_count().await.unwrap(), 1);
    }
}
