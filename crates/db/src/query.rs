// crates/db/src/query.rs
//! Read and rebuild filters over rollup keys.

use chrono::NaiveDate;
use hudcache_core::{GametypeId, HandPlayerFact, KeyValue, PlayerId, RollupTable, StyleKey};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Null-safe equality: `Eq(KeyValue::Null)` matches only null.
    Eq(KeyValue),
    In(Vec<KeyValue>),
    /// Inclusive range; an open side is unbounded.
    Range {
        low: Option<KeyValue>,
        high: Option<KeyValue>,
    },
}

/// Conditions on key columns of one rollup table, combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFilter {
    pub table: RollupTable,
    pub conditions: Vec<(String, Condition)>,
}

impl KeyFilter {
    pub fn new(table: RollupTable) -> Self {
        Self {
            table,
            conditions: Vec::new(),
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<KeyValue>) -> Self {
        self.conditions
            .push((column.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn any_of(mut self, column: &str, values: Vec<KeyValue>) -> Self {
        self.conditions
            .push((column.to_string(), Condition::In(values)));
        self
    }

    pub fn range(
        mut self,
        column: &str,
        low: Option<KeyValue>,
        high: Option<KeyValue>,
    ) -> Self {
        self.conditions
            .push((column.to_string(), Condition::Range { low, high }));
        self
    }

    pub fn player(self, player_id: PlayerId) -> Self {
        self.eq("player_id", player_id)
    }

    pub fn style(self, style: StyleKey) -> Self {
        self.eq("style_key", style)
    }

    /// HudCache rows of daily style keys from `date` onwards.
    pub fn style_since(self, date: NaiveDate) -> Self {
        self.range(
            "style_key",
            Some(StyleKey::SinceDate(date).into()),
            Some(StyleKey::latest_date().into()),
        )
    }

    /// Every condition must name a key or attribute column of the table.
    pub fn validate(&self) -> DbResult<()> {
        let attributes = self.table.attribute_columns();
        for (column, _) in &self.conditions {
            let known = self.table.has_key_column(column)
                || attributes.iter().any(|c| c.name == column);
            if !known {
                return Err(DbError::UnknownColumn {
                    table: self.table,
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Scope of a rebuild. Empty lists mean "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildFilter {
    #[serde(default)]
    pub players: Vec<PlayerId>,
    #[serde(default)]
    pub gametypes: Vec<GametypeId>,
}

impl RebuildFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn players(players: Vec<PlayerId>) -> Self {
        Self {
            players,
            gametypes: Vec::new(),
        }
    }

    pub fn is_all(&self) -> bool {
        self.players.is_empty() && self.gametypes.is_empty()
    }

    pub fn matches(&self, fact: &HandPlayerFact) -> bool {
        (self.players.is_empty() || self.players.contains(&fact.player_id))
            && (self.gametypes.is_empty() || self.gametypes.contains(&fact.gametype_id))
    }

    /// A scope is only rebuildable if every row it selects is derived
    /// solely from facts it selects, which requires the scoped columns to be
    /// part of the table's key.
    pub fn validate_for(&self, table: RollupTable) -> DbResult<()> {
        if !self.gametypes.is_empty() && !table.has_key_column("gametype_id") {
            return Err(DbError::InvalidFilter {
                table,
                reason: "table is not keyed by gametype",
            });
        }
        Ok(())
    }

    /// The rows of `table` this scope covers.
    pub fn key_filter(&self, table: RollupTable) -> KeyFilter {
        let mut filter = KeyFilter::new(table);
        if !self.players.is_empty() {
            filter = filter.any_of(
                "player_id",
                self.players.iter().map(|p| KeyValue::Int(*p)).collect(),
            );
        }
        if !self.gametypes.is_empty() {
            filter = filter.any_of(
                "gametype_id",
                self.gametypes.iter().map(|g| KeyValue::Int(*g)).collect(),
            );
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hudcache_core::Position;

    #[test]
    fn test_unknown_column_is_rejected() {
        let filter = KeyFilter::new(RollupTable::Cards).eq("style_key", "A");
        assert!(matches!(
            filter.validate(),
            Err(DbError::UnknownColumn { .. })
        ));
        let filter = KeyFilter::new(RollupTable::Tourneys).eq("session_id", 3i64);
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_gametype_scope_rejected_for_tourneys() {
        let filter = RebuildFilter {
            players: vec![],
            gametypes: vec![1],
        };
        assert!(filter.validate_for(RollupTable::Hud).is_ok());
        assert!(matches!(
            filter.validate_for(RollupTable::Tourneys),
            Err(DbError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_filter_matches_fact() {
        let fact = HandPlayerFact::new(1, 10, 5, 6, Position::BUTTON);
        assert!(RebuildFilter::all().matches(&fact));
        assert!(RebuildFilter::players(vec![10, 11]).matches(&fact));
        assert!(!RebuildFilter::players(vec![11]).matches(&fact));
    }
}
