// crates/db/src/schema.rs
//! SQL for the rollup tables, generated from the key column lists and the
//! stat catalog. Built once per process.

use std::sync::OnceLock;

use hudcache_core::{ColumnKind, RollupTable, StatLine};

pub(crate) struct TableSql {
    pub create: String,
    pub indexes: Vec<String>,
    /// Every column, in decode order.
    pub select: String,
    /// Binds: dim_key, key values, attributes, n, counts, amounts.
    pub insert: String,
    /// Binds: n, counts, amounts, dim_key, key values.
    pub increment: String,
    /// Binds: dim_key.
    pub lookup: String,
}

static SQL: OnceLock<Vec<TableSql>> = OnceLock::new();

pub(crate) fn table_sql(table: RollupTable) -> &'static TableSql {
    let all = SQL.get_or_init(|| RollupTable::ALL.iter().map(|t| build(*t)).collect());
    let index = RollupTable::ALL
        .iter()
        .position(|t| *t == table)
        .unwrap_or_default();
    &all[index]
}

/// `(column, typedef)` for every stat column, used for reconciliation.
pub(crate) fn stat_column_defs() -> impl Iterator<Item = (&'static str, &'static str)> {
    let counts = StatLine::COUNT_COLUMNS
        .iter()
        .map(|c| (*c, "INTEGER NOT NULL DEFAULT 0"));
    let amounts = StatLine::AMOUNT_COLUMNS
        .iter()
        .map(|c| (*c, "REAL NOT NULL DEFAULT 0"));
    counts.chain(amounts)
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Text => "TEXT",
    }
}

fn build(table: RollupTable) -> TableSql {
    let name = table.table_name();
    let keys = table.key_columns();
    let attributes = table.attribute_columns();
    let stats: Vec<&str> = StatLine::COUNT_COLUMNS
        .iter()
        .chain(StatLine::AMOUNT_COLUMNS)
        .copied()
        .collect();

    let mut defs = vec![
        "id INTEGER PRIMARY KEY".to_string(),
        "dim_key TEXT NOT NULL UNIQUE".to_string(),
    ];
    defs.extend(
        keys.iter()
            .chain(attributes)
            .map(|c| format!("{} {}", c.name, sql_type(c.kind))),
    );
    defs.push("n INTEGER NOT NULL DEFAULT 0".to_string());
    defs.extend(stat_column_defs().map(|(c, t)| format!("{c} {t}")));
    let create = format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    {}\n)",
        defs.join(",\n    ")
    );

    let mut indexes = vec![format!(
        "CREATE INDEX IF NOT EXISTS idx_{name}_player ON {name}(player_id)"
    )];
    match table {
        RollupTable::Hud => indexes.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{name}_style ON {name}(player_id, style_key)"
        )),
        RollupTable::Sessions | RollupTable::Tourneys => indexes.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{name}_session ON {name}(session_id)"
        )),
        RollupTable::Cards | RollupTable::Positions => {}
    }

    let mut written: Vec<&str> = vec!["dim_key"];
    written.extend(keys.iter().chain(attributes).map(|c| c.name));
    written.push("n");
    written.extend(&stats);
    let placeholders = vec!["?"; written.len()].join(", ");
    let insert = format!(
        "INSERT INTO {name} ({}) VALUES ({placeholders})",
        written.join(", ")
    );

    let select = written.join(", ");

    let mut sets = vec!["n = n + ?".to_string()];
    sets.extend(stats.iter().map(|c| format!("{c} = {c} + ?")));
    let mut conditions = vec!["dim_key = ?".to_string()];
    conditions.extend(keys.iter().map(|c| format!("{} IS ?", c.name)));
    let increment = format!(
        "UPDATE {name} SET {} WHERE {}",
        sets.join(", "),
        conditions.join(" AND ")
    );

    let lookup_columns: Vec<&str> = keys.iter().map(|c| c.name).collect();
    let lookup = format!(
        "SELECT {} FROM {name} WHERE dim_key = ?",
        lookup_columns.join(", ")
    );

    TableSql {
        create,
        indexes,
        select,
        insert,
        increment,
        lookup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_has_sql() {
        for table in RollupTable::ALL {
            let sql = table_sql(table);
            assert!(sql.create.contains(table.table_name()));
            assert!(sql.increment.starts_with(&format!("UPDATE {}", table.table_name())));
        }
    }

    #[test]
    fn test_insert_placeholders_match_columns() {
        let sql = table_sql(RollupTable::Tourneys);
        let columns = sql.select.split(", ").count();
        assert_eq!(sql.insert.matches('?').count(), columns);
        assert!(sql.select.contains("session_id"));
    }

    #[test]
    fn test_increment_matches_null_safe() {
        let sql = table_sql(RollupTable::Hud);
        assert!(sql.increment.contains("tourney_type_id IS ?"));
        let binds = 1 + StatLine::COUNT_COLUMNS.len() + StatLine::AMOUNT_COLUMNS.len() + 1 + 6;
        assert_eq!(sql.increment.matches('?').count(), binds);
    }
}
