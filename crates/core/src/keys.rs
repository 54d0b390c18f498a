// crates/core/src/keys.rs
//! Rollup tables and their dimension keys.
//!
//! [`derive_keys`] is the single place a fact is mapped onto every rollup.
//! Typed keys lower into a [`DimensionKey`], the type-erased form the
//! storage layer works with.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fact::{
    GametypeId, HandContext, HandPlayerFact, MonthId, PlayerId, Position, SessionId, StartCards,
    TourneyId, TourneyTypeId, WeekId,
};
use crate::style::{StyleKey, StyleMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupTable {
    Hud,
    Cards,
    Positions,
    Sessions,
    Tourneys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn int(name: &'static str) -> KeyColumn {
    KeyColumn {
        name,
        kind: ColumnKind::Integer,
    }
}

const fn text(name: &'static str) -> KeyColumn {
    KeyColumn {
        name,
        kind: ColumnKind::Text,
    }
}

const HUD_COLUMNS: &[KeyColumn] = &[
    int("gametype_id"),
    int("player_id"),
    int("seats"),
    text("position"),
    int("tourney_type_id"),
    text("style_key"),
];
const CARDS_COLUMNS: &[KeyColumn] = &[
    int("week_id"),
    int("month_id"),
    int("gametype_id"),
    int("tourney_type_id"),
    int("player_id"),
    int("start_cards"),
];
const POSITIONS_COLUMNS: &[KeyColumn] = &[
    int("week_id"),
    int("month_id"),
    int("gametype_id"),
    int("tourney_type_id"),
    int("player_id"),
    int("seats"),
    int("max_position"),
    text("position"),
];
const SESSIONS_COLUMNS: &[KeyColumn] = &[int("session_id"), int("gametype_id"), int("player_id")];
const TOURNEYS_COLUMNS: &[KeyColumn] = &[int("tourney_id"), int("player_id")];
const TOURNEYS_ATTRIBUTES: &[KeyColumn] = &[int("session_id")];

impl RollupTable {
    pub const ALL: [RollupTable; 5] = [
        RollupTable::Hud,
        RollupTable::Cards,
        RollupTable::Positions,
        RollupTable::Sessions,
        RollupTable::Tourneys,
    ];

    /// Physical table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            RollupTable::Hud => "hud_cache",
            RollupTable::Cards => "cards_cache",
            RollupTable::Positions => "positions_cache",
            RollupTable::Sessions => "sessions_cache",
            RollupTable::Tourneys => "tourneys_cache",
        }
    }

    /// Dimension key columns, in key order.
    pub fn key_columns(&self) -> &'static [KeyColumn] {
        match self {
            RollupTable::Hud => HUD_COLUMNS,
            RollupTable::Cards => CARDS_COLUMNS,
            RollupTable::Positions => POSITIONS_COLUMNS,
            RollupTable::Sessions => SESSIONS_COLUMNS,
            RollupTable::Tourneys => TOURNEYS_COLUMNS,
        }
    }

    /// Non-key columns written when a row is first created.
    pub fn attribute_columns(&self) -> &'static [KeyColumn] {
        match self {
            RollupTable::Tourneys => TOURNEYS_ATTRIBUTES,
            _ => &[],
        }
    }

    pub fn has_key_column(&self, name: &str) -> bool {
        self.key_columns().iter().any(|c| c.name == name)
    }
}

impl fmt::Display for RollupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rollup table {0:?}")]
pub struct UnknownTable(pub String);

impl FromStr for RollupTable {
    type Err = UnknownTable;

    /// Accepts `hud`, `hud_cache`, `HudCache` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let trimmed = normalized.strip_suffix("cache").unwrap_or(&normalized);
        match trimmed {
            "hud" => Ok(RollupTable::Hud),
            "cards" => Ok(RollupTable::Cards),
            "positions" => Ok(RollupTable::Positions),
            "sessions" => Ok(RollupTable::Sessions),
            "tourneys" => Ok(RollupTable::Tourneys),
            _ => Err(UnknownTable(s.to_string())),
        }
    }
}

/// One component of a dimension key. `Null` is its own value, never a
/// sentinel standing in for one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Int(i64),
    Text(String),
}

impl KeyValue {
    fn encode_into(&self, out: &mut String) {
        match self {
            KeyValue::Null => out.push('~'),
            KeyValue::Int(v) => {
                out.push('i');
                out.push_str(&v.to_string());
            }
            KeyValue::Text(s) => {
                out.push('s');
                for c in s.chars() {
                    if c == '/' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => f.write_str("NULL"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<u8> for KeyValue {
    fn from(v: u8) -> Self {
        KeyValue::Int(i64::from(v))
    }
}

impl From<StartCards> for KeyValue {
    fn from(v: StartCards) -> Self {
        KeyValue::Int(i64::from(v))
    }
}

impl From<Option<i64>> for KeyValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(KeyValue::Null, KeyValue::Int)
    }
}

impl From<Position> for KeyValue {
    fn from(p: Position) -> Self {
        KeyValue::Text(p.to_string())
    }
}

impl From<StyleKey> for KeyValue {
    fn from(s: StyleKey) -> Self {
        KeyValue::Text(s.encode())
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Text(s.to_string())
    }
}

/// Type-erased dimension key: values aligned with the table's key columns,
/// plus insert-time attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    pub table: RollupTable,
    pub values: Vec<KeyValue>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

impl DimensionKey {
    pub fn new(table: RollupTable, values: Vec<KeyValue>) -> Self {
        let attributes = vec![KeyValue::Null; table.attribute_columns().len()];
        Self {
            table,
            values,
            attributes,
        }
    }

    /// Injective text encoding of the key values, stored as the row's
    /// unique physical key.
    pub fn physical_key(&self) -> String {
        let mut out = String::new();
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            v.encode_into(&mut out);
        }
        out
    }

    pub fn value(&self, column: &str) -> Option<&KeyValue> {
        self.table
            .key_columns()
            .iter()
            .position(|c| c.name == column)
            .and_then(|i| self.values.get(i))
    }

    /// The key with one column replaced; `None` if the column is not part of
    /// this table's key.
    pub fn with_value(&self, column: &str, value: KeyValue) -> Option<DimensionKey> {
        let index = self.table.key_columns().iter().position(|c| c.name == column)?;
        let mut key = self.clone();
        key.values[index] = value;
        Some(key)
    }

    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Column/value pairs, for logging.
    pub fn describe(&self) -> String {
        self.table
            .key_columns()
            .iter()
            .zip(&self.values)
            .map(|(c, v)| format!("{}={}", c.name, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HudKey {
    pub gametype_id: GametypeId,
    pub player_id: PlayerId,
    pub seats: u8,
    pub position: Position,
    pub tourney_type_id: Option<TourneyTypeId>,
    pub style: StyleKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardsKey {
    pub week_id: WeekId,
    pub month_id: MonthId,
    pub gametype_id: GametypeId,
    pub tourney_type_id: Option<TourneyTypeId>,
    pub player_id: PlayerId,
    pub start_cards: StartCards,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionsKey {
    pub week_id: WeekId,
    pub month_id: MonthId,
    pub gametype_id: GametypeId,
    pub tourney_type_id: Option<TourneyTypeId>,
    pub player_id: PlayerId,
    pub seats: u8,
    pub max_position: u8,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: SessionId,
    pub gametype_id: GametypeId,
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TourneyKey {
    pub tourney_id: TourneyId,
    pub player_id: PlayerId,
    /// Not part of the key: the session the tournament was played in.
    pub session_id: Option<SessionId>,
}

impl From<&HudKey> for DimensionKey {
    fn from(k: &HudKey) -> Self {
        DimensionKey::new(
            RollupTable::Hud,
            vec![
                k.gametype_id.into(),
                k.player_id.into(),
                k.seats.into(),
                k.position.into(),
                k.tourney_type_id.into(),
                k.style.into(),
            ],
        )
    }
}

impl From<&CardsKey> for DimensionKey {
    fn from(k: &CardsKey) -> Self {
        DimensionKey::new(
            RollupTable::Cards,
            vec![
                k.week_id.into(),
                k.month_id.into(),
                k.gametype_id.into(),
                k.tourney_type_id.into(),
                k.player_id.into(),
                k.start_cards.into(),
            ],
        )
    }
}

impl From<&PositionsKey> for DimensionKey {
    fn from(k: &PositionsKey) -> Self {
        DimensionKey::new(
            RollupTable::Positions,
            vec![
                k.week_id.into(),
                k.month_id.into(),
                k.gametype_id.into(),
                k.tourney_type_id.into(),
                k.player_id.into(),
                k.seats.into(),
                k.max_position.into(),
                k.position.into(),
            ],
        )
    }
}

impl From<&SessionKey> for DimensionKey {
    fn from(k: &SessionKey) -> Self {
        DimensionKey::new(
            RollupTable::Sessions,
            vec![k.session_id.into(), k.gametype_id.into(), k.player_id.into()],
        )
    }
}

impl From<&TourneyKey> for DimensionKey {
    fn from(k: &TourneyKey) -> Self {
        DimensionKey::new(
            RollupTable::Tourneys,
            vec![k.tourney_id.into(), k.player_id.into()],
        )
        .with_attributes(vec![k.session_id.into()])
    }
}

/// Every rollup key one fact contributes to. Session and tourney keys only
/// exist for facts played in a session or a tournament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupKeys {
    pub hud: HudKey,
    pub cards: CardsKey,
    pub positions: PositionsKey,
    pub session: Option<SessionKey>,
    pub tourney: Option<TourneyKey>,
}

impl RollupKeys {
    pub fn get(&self, table: RollupTable) -> Option<DimensionKey> {
        match table {
            RollupTable::Hud => Some((&self.hud).into()),
            RollupTable::Cards => Some((&self.cards).into()),
            RollupTable::Positions => Some((&self.positions).into()),
            RollupTable::Sessions => self.session.as_ref().map(Into::into),
            RollupTable::Tourneys => self.tourney.as_ref().map(Into::into),
        }
    }

    pub fn dimensions(&self) -> Vec<DimensionKey> {
        RollupTable::ALL.iter().filter_map(|t| self.get(*t)).collect()
    }
}

/// Map a fact onto every rollup. Pure and total.
pub fn derive_keys(fact: &HandPlayerFact, ctx: &HandContext, mode: StyleMode) -> RollupKeys {
    RollupKeys {
        hud: HudKey {
            gametype_id: fact.gametype_id,
            player_id: fact.player_id,
            seats: fact.seats,
            position: fact.position,
            tourney_type_id: fact.tourney_type_id,
            style: StyleKey::for_fact(mode, fact, ctx.start_time),
        },
        cards: CardsKey {
            week_id: ctx.week_id,
            month_id: ctx.month_id,
            gametype_id: fact.gametype_id,
            tourney_type_id: fact.tourney_type_id,
            player_id: fact.player_id,
            start_cards: fact.start_cards,
        },
        positions: PositionsKey {
            week_id: ctx.week_id,
            month_id: ctx.month_id,
            gametype_id: fact.gametype_id,
            tourney_type_id: fact.tourney_type_id,
            player_id: fact.player_id,
            seats: fact.seats,
            max_position: fact.max_position,
            position: fact.position,
        },
        session: fact.session_id.map(|session_id| SessionKey {
            session_id,
            gametype_id: fact.gametype_id,
            player_id: fact.player_id,
        }),
        tourney: fact.tourney_id.map(|tourney_id| TourneyKey {
            tourney_id,
            player_id: fact.player_id,
            session_id: fact.session_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn ctx() -> HandContext {
        HandContext {
            hand_id: 1,
            start_time: Utc.with_ymd_and_hms(2024, 3, 15, 20, 0, 0).unwrap(),
            week_id: 3,
            month_id: 4,
        }
    }

    fn ring_fact() -> HandPlayerFact {
        HandPlayerFact::new(1, 10, 5, 6, Position::BIG_BLIND)
    }

    #[test]
    fn test_table_parsing() {
        assert_eq!("hud".parse::<RollupTable>().unwrap(), RollupTable::Hud);
        assert_eq!("HudCache".parse::<RollupTable>().unwrap(), RollupTable::Hud);
        assert_eq!(
            "positions_cache".parse::<RollupTable>().unwrap(),
            RollupTable::Positions
        );
        assert!("players".parse::<RollupTable>().is_err());
    }

    #[test]
    fn test_ring_fact_has_no_tourney_or_session_key() {
        let keys = derive_keys(&ring_fact(), &ctx(), StyleMode::AllTime);
        assert!(keys.tourney.is_none());
        assert!(keys.session.is_none());
        assert_eq!(keys.dimensions().len(), 3);
    }

    #[test]
    fn test_hud_key_matches_fact() {
        let keys = derive_keys(&ring_fact(), &ctx(), StyleMode::AllTime);
        let dim = keys.get(RollupTable::Hud).unwrap();
        assert_eq!(dim.value("gametype_id"), Some(&KeyValue::Int(5)));
        assert_eq!(dim.value("position"), Some(&KeyValue::Text("B".into())));
        assert_eq!(dim.value("tourney_type_id"), Some(&KeyValue::Null));
        assert_eq!(dim.value("style_key"), Some(&KeyValue::Text("A".into())));
        assert_eq!(dim.physical_key(), "i5/i10/i6/sB/~/sA");
    }

    #[test]
    fn test_null_tourney_type_never_collides_with_a_tournament() {
        let ring = ring_fact();
        let mut tourney = ring_fact();
        tourney.tourney_id = Some(0);
        tourney.tourney_type_id = Some(0);

        for table in [RollupTable::Hud, RollupTable::Cards, RollupTable::Positions] {
            let a = derive_keys(&ring, &ctx(), StyleMode::AllTime).get(table).unwrap();
            let b = derive_keys(&tourney, &ctx(), StyleMode::AllTime)
                .get(table)
                .unwrap();
            assert_ne!(a.physical_key(), b.physical_key(), "{table}");
        }
    }

    #[test]
    fn test_tourney_key_carries_session_attribute() {
        let mut fact = ring_fact();
        fact.tourney_id = Some(77);
        fact.tourney_type_id = Some(2);
        fact.session_id = Some(9);
        let dim = derive_keys(&fact, &ctx(), StyleMode::AllTime)
            .get(RollupTable::Tourneys)
            .unwrap();
        assert_eq!(dim.physical_key(), "i77/i10");
        assert_eq!(dim.attributes, vec![KeyValue::Int(9)]);
    }

    #[test]
    fn test_text_escaping_keeps_encoding_injective() {
        let a = DimensionKey::new(RollupTable::Sessions, vec!["a/".into(), "b".into()]);
        let b = DimensionKey::new(RollupTable::Sessions, vec!["a".into(), "/b".into()]);
        assert_ne!(a.physical_key(), b.physical_key());
    }

    #[test]
    fn test_with_value_rekeys_one_column() {
        let key = DimensionKey::from(&SessionKey {
            session_id: 1,
            gametype_id: 2,
            player_id: 3,
        });
        let moved = key.with_value("session_id", KeyValue::Int(8)).unwrap();
        assert_eq!(moved.physical_key(), "i8/i2/i3");
        assert!(key.with_value("week_id", KeyValue::Int(1)).is_none());
    }
}
