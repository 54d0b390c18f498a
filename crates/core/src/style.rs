// crates/core/src/style.rs
//! HudCache partition discriminator.
//!
//! One physical HudCache answers "all time", "since date X", "this session"
//! and "this tournament" queries by partitioning rows on a [`StyleKey`].
//! The storage encoding sorts lexically in the same order as `Ord`, so a
//! range over the stored column is a date-range filter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::fact::{HandPlayerFact, SessionId, TourneyId};
use crate::time::MAX_SUPPORTED_YEAR;

/// Declaration order is the sort order, and matches the encoding tags
/// `A` < `D` < `S` < `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StyleKey {
    All,
    SinceDate(NaiveDate),
    Session(SessionId),
    Tourney(TourneyId),
}

/// How facts are partitioned into HudCache style keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleMode {
    #[default]
    AllTime,
    Daily,
    Session,
    Tourney,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid style key {0:?}")]
pub struct StyleKeyParseError(pub String);

const ID_WIDTH: usize = 19;

impl StyleKey {
    /// The style key a fact lands in under `mode`.
    ///
    /// Session and tourney modes fall back to `All` for facts without a
    /// session or outside a tournament.
    pub fn for_fact(mode: StyleMode, fact: &HandPlayerFact, start_time: DateTime<Utc>) -> Self {
        match mode {
            StyleMode::AllTime => StyleKey::All,
            StyleMode::Daily => StyleKey::SinceDate(start_time.date_naive()),
            StyleMode::Session => fact.session_id.map_or(StyleKey::All, StyleKey::Session),
            StyleMode::Tourney => fact.tourney_id.map_or(StyleKey::All, StyleKey::Tourney),
        }
    }

    /// Latest representable `SinceDate`, the upper bound of open date ranges.
    pub fn latest_date() -> StyleKey {
        StyleKey::SinceDate(
            NaiveDate::from_ymd_opt(MAX_SUPPORTED_YEAR, 12, 31).unwrap_or(NaiveDate::MAX),
        )
    }

    pub fn encode(&self) -> String {
        match self {
            StyleKey::All => "A".to_string(),
            StyleKey::SinceDate(d) => format!("D{}", d.format("%Y%m%d")),
            StyleKey::Session(id) => format!("S{:0width$}", id, width = ID_WIDTH),
            StyleKey::Tourney(id) => format!("T{:0width$}", id, width = ID_WIDTH),
        }
    }
}

impl fmt::Display for StyleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for StyleKey {
    type Err = StyleKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || StyleKeyParseError(s.to_string());
        let (tag, rest) = s.split_at_checked(1).ok_or_else(err)?;
        match tag {
            "A" if rest.is_empty() => Ok(StyleKey::All),
            "D" if rest.len() == 8 => NaiveDate::parse_from_str(rest, "%Y%m%d")
                .map(StyleKey::SinceDate)
                .map_err(|_| err()),
            "S" if rest.len() == ID_WIDTH => {
                rest.parse().map(StyleKey::Session).map_err(|_| err())
            }
            "T" if rest.len() == ID_WIDTH => {
                rest.parse().map(StyleKey::Tourney).map_err(|_| err())
            }
            _ => Err(err()),
        }
    }
}

impl Serialize for StyleKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for StyleKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
