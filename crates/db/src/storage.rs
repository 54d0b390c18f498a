// crates/db/src/storage.rs
//! SQLite implementation of [`AggregatePort`].

use async_trait::async_trait;
use chrono::DateTime;
use hudcache_core::{
    AggregateRow, ColumnKind, DimensionKey, KeyColumn, KeyValue, RollupTable, StatLine,
};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::port::{AggregatePort, Increment, RollupMeta, StoredRow};
use crate::query::{Condition, KeyFilter, RebuildFilter};
use crate::schema;
use crate::{Database, DbError, DbResult};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_key_value<'q>(query: SqliteQuery<'q>, value: &KeyValue) -> SqliteQuery<'q> {
    match value {
        KeyValue::Null => query.bind(None::<i64>),
        KeyValue::Int(v) => query.bind(*v),
        KeyValue::Text(s) => query.bind(s.clone()),
    }
}

fn bind_stats<'q>(mut query: SqliteQuery<'q>, row: &AggregateRow) -> SqliteQuery<'q> {
    query = query.bind(row.n);
    for v in row.stats.counts() {
        query = query.bind(v);
    }
    for v in row.stats.amounts() {
        query = query.bind(v);
    }
    query
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &KeyValue) {
    match value {
        KeyValue::Null => qb.push("NULL"),
        KeyValue::Int(v) => qb.push_bind(*v),
        KeyValue::Text(s) => qb.push_bind(s.clone()),
    };
}

/// Append `AND ...` clauses for a validated filter.
pub(crate) fn push_conditions(qb: &mut QueryBuilder<'_, Sqlite>, filter: &KeyFilter) {
    for (column, condition) in &filter.conditions {
        match condition {
            Condition::Eq(KeyValue::Null) => {
                qb.push(format!(" AND {column} IS NULL"));
            }
            Condition::Eq(value) => {
                qb.push(format!(" AND {column} = "));
                push_value(qb, value);
            }
            Condition::In(values) if values.is_empty() => {
                qb.push(" AND 0");
            }
            Condition::In(values) => {
                let with_null = values.contains(&KeyValue::Null);
                let present: Vec<&KeyValue> =
                    values.iter().filter(|v| **v != KeyValue::Null).collect();
                if present.is_empty() {
                    qb.push(format!(" AND {column} IS NULL"));
                    continue;
                }
                qb.push(format!(" AND ({column} IN ("));
                let mut separated = qb.separated(", ");
                for value in present {
                    match value {
                        KeyValue::Int(v) => separated.push_bind(*v),
                        KeyValue::Text(s) => separated.push_bind(s.clone()),
                        KeyValue::Null => separated.push("NULL"),
                    };
                }
                separated.push_unseparated(")");
                if with_null {
                    qb.push(format!(" OR {column} IS NULL"));
                }
                qb.push(")");
            }
            Condition::Range { low, high } => {
                if let Some(low) = low {
                    qb.push(format!(" AND {column} >= "));
                    push_value(qb, low);
                }
                if let Some(high) = high {
                    qb.push(format!(" AND {column} <= "));
                    push_value(qb, high);
                }
            }
        }
    }
}

fn decode_key_values(row: &SqliteRow, columns: &[KeyColumn]) -> Result<Vec<KeyValue>, sqlx::Error> {
    columns
        .iter()
        .map(|c| {
            Ok(match c.kind {
                ColumnKind::Integer => row.try_get::<Option<i64>, _>(c.name)?.into(),
                ColumnKind::Text => row
                    .try_get::<Option<String>, _>(c.name)?
                    .map_or(KeyValue::Null, KeyValue::Text),
            })
        })
        .collect()
}

pub(crate) fn decode_row(row: &SqliteRow, table: RollupTable) -> DbResult<StoredRow> {
    let physical_key: String = row.try_get("dim_key")?;
    let values = decode_key_values(row, table.key_columns())?;
    let attributes = decode_key_values(row, table.attribute_columns())?;
    let stats = StatLine::try_from_columns(
        |c| row.try_get::<i64, _>(c),
        |c| row.try_get::<f64, _>(c),
    )?;
    Ok(StoredRow {
        key: DimensionKey::new(table, values).with_attributes(attributes),
        physical_key,
        row: AggregateRow {
            n: row.try_get("n")?,
            stats,
        },
    })
}

/// Increment on an open connection or transaction. A miss is
/// distinguished from a physical key that holds different key values.
pub(crate) async fn increment_on(
    conn: &mut SqliteConnection,
    key: &DimensionKey,
    delta: &AggregateRow,
) -> DbResult<Increment> {
    let sql = schema::table_sql(key.table);
    let physical_key = key.physical_key();

    let mut query = bind_stats(sqlx::query(&sql.increment), delta).bind(physical_key.clone());
    for value in &key.values {
        query = bind_key_value(query, value);
    }
    if query.execute(&mut *conn).await?.rows_affected() > 0 {
        return Ok(Increment::Applied);
    }

    let stored = sqlx::query(&sql.lookup)
        .bind(&physical_key)
        .fetch_optional(&mut *conn)
        .await?;
    match stored {
        None => Ok(Increment::Missing),
        Some(row) => {
            let stored = decode_key_values(&row, key.table.key_columns())?;
            Err(DbError::KeyCollision {
                table: key.table,
                physical_key,
                stored: DimensionKey::new(key.table, stored).describe(),
                incoming: key.describe(),
            })
        }
    }
}

pub(crate) async fn insert_on(
    conn: &mut SqliteConnection,
    key: &DimensionKey,
    row: &AggregateRow,
) -> DbResult<()> {
    let sql = schema::table_sql(key.table);
    let mut query = sqlx::query(&sql.insert).bind(key.physical_key());
    for value in key.values.iter().chain(&key.attributes) {
        query = bind_key_value(query, value);
    }
    bind_stats(query, row).execute(&mut *conn).await?;
    Ok(())
}

/// Rows matching `filter`, ordered by physical key.
pub(crate) async fn fetch_on(
    conn: &mut SqliteConnection,
    filter: &KeyFilter,
) -> DbResult<Vec<StoredRow>> {
    filter.validate()?;
    let sql = schema::table_sql(filter.table);
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM {} WHERE 1 = 1",
        sql.select,
        filter.table.table_name()
    ));
    push_conditions(&mut qb, filter);
    qb.push(" ORDER BY dim_key");
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(|r| decode_row(r, filter.table)).collect()
}

#[async_trait]
impl AggregatePort for Database {
    async fn increment(&self, key: &DimensionKey, delta: &AggregateRow) -> DbResult<Increment> {
        let mut conn = self.pool().acquire().await?;
        increment_on(&mut conn, key, delta).await
    }

    async fn insert(&self, key: &DimensionKey, row: &AggregateRow) -> DbResult<()> {
        let mut conn = self.pool().acquire().await?;
        insert_on(&mut conn, key, row).await
    }

    async fn write_batch(&self, rows: &[(DimensionKey, AggregateRow)]) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        for (key, row) in rows {
            if increment_on(&mut tx, key, row).await? == Increment::Missing {
                insert_on(&mut tx, key, row).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace(
        &self,
        table: RollupTable,
        scope: &RebuildFilter,
        rows: &[(DimensionKey, AggregateRow)],
        meta: Option<&RollupMeta>,
    ) -> DbResult<u64> {
        let mut tx = self.pool().begin().await?;

        let mut delete =
            QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE 1 = 1", table.table_name()));
        push_conditions(&mut delete, &scope.key_filter(table));
        let removed = delete.build().execute(&mut *tx).await?.rows_affected();

        for (key, row) in rows {
            insert_on(&mut tx, key, row).await?;
        }

        if let Some(meta) = meta {
            sqlx::query(
                r#"INSERT INTO rollup_meta (table_name, rebuilt_at, fact_watermark, row_count, fingerprint)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(table_name) DO UPDATE SET
                       rebuilt_at = excluded.rebuilt_at,
                       fact_watermark = excluded.fact_watermark,
                       row_count = excluded.row_count,
                       fingerprint = excluded.fingerprint"#,
            )
            .bind(meta.table.table_name())
            .bind(meta.rebuilt_at.timestamp())
            .bind(meta.fact_watermark)
            .bind(meta.row_count as i64)
            .bind(&meta.fingerprint)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn fetch(&self, filter: &KeyFilter) -> DbResult<Vec<StoredRow>> {
        let mut conn = self.pool().acquire().await?;
        fetch_on(&mut conn, filter).await
    }

    async fn count_rows(&self, table: RollupTable) -> DbResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table.table_name()))
                .fetch_one(self.pool())
                .await?;
        Ok(count as u64)
    }

    async fn read_meta(&self, table: RollupTable) -> DbResult<Option<RollupMeta>> {
        let row: Option<(i64, i64, i64, String)> = sqlx::query_as(
            "SELECT rebuilt_at, fact_watermark, row_count, fingerprint FROM rollup_meta WHERE table_name = ?",
        )
        .bind(table.table_name())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(rebuilt_at, fact_watermark, row_count, fingerprint)| RollupMeta {
            table,
            rebuilt_at: DateTime::from_timestamp(rebuilt_at, 0).unwrap_or_default(),
            fact_watermark,
            row_count: row_count as u64,
            fingerprint,
        }))
    }

    async fn delete_meta(&self, table: RollupTable) -> DbResult<()> {
        sqlx::query("DELETE FROM rollup_meta WHERE table_name = ?")
            .bind(table.table_name())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session_key(session_id: i64, player_id: i64) -> DimensionKey {
        DimensionKey::new(
            RollupTable::Sessions,
            vec![session_id.into(), 1i64.into(), player_id.into()],
        )
    }

    fn delta(profit: f64) -> AggregateRow {
        AggregateRow::from_stats(&StatLine {
            street0_vpi_chance: 1,
            total_profit: profit,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_increment_misses_then_applies() {
        let db = Database::new_in_memory().await.unwrap();
        let key = session_key(1, 10);

        assert_eq!(db.increment(&key, &delta(1.0)).await.unwrap(), Increment::Missing);
        db.insert(&key, &delta(1.0)).await.unwrap();
        assert_eq!(db.increment(&key, &delta(2.5)).await.unwrap(), Increment::Applied);

        let rows = db.fetch(&KeyFilter::new(RollupTable::Sessions)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, key);
        assert_eq!(rows[0].row.n, 2);
        assert_eq!(rows[0].row.stats.street0_vpi_chance, 2);
        assert_eq!(rows[0].row.stats.total_profit, 3.5);
    }

    #[tokio::test]
    async fn test_corrupted_row_is_a_collision_not_a_miss() {
        let db = Database::new_in_memory().await.unwrap();
        let key = session_key(1, 10);
        db.insert(&key, &delta(0.0)).await.unwrap();
        sqlx::query("UPDATE sessions_cache SET player_id = 99")
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.increment(&key, &delta(0.0)).await.unwrap_err();
        match err {
            DbError::KeyCollision { stored, incoming, .. } => {
                assert!(stored.contains("player_id=99"));
                assert!(incoming.contains("player_id=10"));
            }
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_null_safely() {
        let db = Database::new_in_memory().await.unwrap();
        let ring = DimensionKey::new(
            RollupTable::Cards,
            vec![1i64.into(), 1i64.into(), 5i64.into(), KeyValue::Null, 10i64.into(), 3i64.into()],
        );
        let tourney = ring.with_value("tourney_type_id", KeyValue::Int(0)).unwrap();
        db.write_batch(&[(ring.clone(), delta(1.0)), (tourney.clone(), delta(2.0))])
            .await
            .unwrap();

        let only_ring = db
            .fetch(&KeyFilter::new(RollupTable::Cards).eq("tourney_type_id", KeyValue::Null))
            .await
            .unwrap();
        assert_eq!(only_ring.len(), 1);
        assert_eq!(only_ring[0].key, ring);

        let only_zero = db
            .fetch(&KeyFilter::new(RollupTable::Cards).eq("tourney_type_id", 0i64))
            .await
            .unwrap();
        assert_eq!(only_zero.len(), 1);
        assert_eq!(only_zero[0].key, tourney);
    }

    #[tokio::test]
    async fn test_any_of_matches_null_members() {
        let db = Database::new_in_memory().await.unwrap();
        let ring = DimensionKey::new(
            RollupTable::Cards,
            vec![1i64.into(), 1i64.into(), 5i64.into(), KeyValue::Null, 10i64.into(), 3i64.into()],
        );
        let zero = ring.with_value("tourney_type_id", KeyValue::Int(0)).unwrap();
        let seven = ring.with_value("tourney_type_id", KeyValue::Int(7)).unwrap();
        db.write_batch(&[
            (ring.clone(), delta(1.0)),
            (zero.clone(), delta(2.0)),
            (seven.clone(), delta(3.0)),
        ])
        .await
        .unwrap();

        let fetch = |values: Vec<KeyValue>| {
            let db = db.clone();
            async move {
                let mut keys: Vec<DimensionKey> = db
                    .fetch(&KeyFilter::new(RollupTable::Cards).any_of("tourney_type_id", values))
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|r| r.key)
                    .collect();
                keys.sort_by_key(|k| k.physical_key());
                keys
            }
        };
        let mut ring_or_seven = vec![ring.clone(), seven.clone()];
        ring_or_seven.sort_by_key(|k| k.physical_key());

        assert_eq!(fetch(vec![KeyValue::Null, KeyValue::Int(7)]).await, ring_or_seven);
        assert_eq!(fetch(vec![KeyValue::Null]).await, vec![ring]);
        assert_eq!(fetch(vec![KeyValue::Int(0)]).await, vec![zero]);
        assert!(fetch(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_replace_is_scoped() {
        let db = Database::new_in_memory().await.unwrap();
        db.write_batch(&[
            (session_key(1, 10), delta(1.0)),
            (session_key(1, 11), delta(1.0)),
        ])
        .await
        .unwrap();

        let removed = db
            .replace(
                RollupTable::Sessions,
                &RebuildFilter::players(vec![10]),
                &[(session_key(2, 10), delta(4.0))],
                None,
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let keys: Vec<String> = db
            .fetch(&KeyFilter::new(RollupTable::Sessions))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.physical_key)
            .collect();
        assert_eq!(keys, vec!["i1/i1/i11".to_string(), "i2/i1/i10".to_string()]);
    }

    #[tokio::test]
    async fn test_write_batch_rolls_back_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(&tmp.path().join("batch.db")).await.unwrap();
        let key = session_key(1, 10);
        db.insert(&key, &delta(0.0)).await.unwrap();
        sqlx::query("UPDATE sessions_cache SET gametype_id = 7")
            .execute(db.pool())
            .await
            .unwrap();

        let result = db
            .write_batch(&[(session_key(3, 10), delta(1.0)), (key, delta(1.0))])
            .await;
        assert!(matches!(result, Err(DbError::KeyCollision { .. })));
        assert_eq!(db.count_rows(RollupTable::Sessions).await.unwrap(), 1);
    }
}
