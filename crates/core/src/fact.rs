// crates/core/src/fact.rs
//! Per-hand-per-player fact records, the sole input to every rollup.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FactError;
use crate::stats::{StatLine, DONE_CHANCE_PAIRS};

pub type HandId = i64;
pub type PlayerId = i64;
pub type GametypeId = i64;
pub type TourneyId = i64;
pub type TourneyTypeId = i64;
pub type SessionId = i64;
pub type WeekId = i64;
pub type MonthId = i64;

/// Starting-hand category (e.g. 1..=169 for hold'em, 0 when unknown).
pub type StartCards = u16;

/// Table position: `B` big blind, `S` small blind, or a digit counting back
/// from the button (`0` is the button).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Position(char);

impl Position {
    pub const BIG_BLIND: Position = Position('B');
    pub const SMALL_BLIND: Position = Position('S');
    pub const BUTTON: Position = Position('0');

    pub fn new(c: char) -> Result<Self, FactError> {
        if c == 'B' || c == 'S' || c.is_ascii_digit() {
            Ok(Self(c))
        } else {
            Err(FactError::InvalidPosition {
                position: c.to_string(),
            })
        }
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Position {
    type Error = FactError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Position::new(c),
            _ => Err(FactError::InvalidPosition { position: s }),
        }
    }
}

impl From<Position> for String {
    fn from(p: Position) -> Self {
        p.0.to_string()
    }
}

/// One player's observed actions and outcomes in one hand.
///
/// Immutable once recorded: corrections are a new derivation pass, never an
/// edit of the stored fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandPlayerFact {
    pub hand_id: HandId,
    pub player_id: PlayerId,
    pub gametype_id: GametypeId,
    #[serde(default)]
    pub tourney_id: Option<TourneyId>,
    #[serde(default)]
    pub tourney_type_id: Option<TourneyTypeId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub seats: u8,
    pub max_position: u8,
    pub position: Position,
    #[serde(default)]
    pub start_cards: StartCards,
    #[serde(default)]
    pub stats: StatLine,
}

impl HandPlayerFact {
    /// A ring-game fact with zeroed counters.
    pub fn new(
        hand_id: HandId,
        player_id: PlayerId,
        gametype_id: GametypeId,
        seats: u8,
        position: Position,
    ) -> Self {
        Self {
            hand_id,
            player_id,
            gametype_id,
            tourney_id: None,
            tourney_type_id: None,
            session_id: None,
            seats,
            max_position: seats.saturating_sub(1),
            position,
            start_cards: 0,
            stats: StatLine::default(),
        }
    }

    pub fn is_tourney(&self) -> bool {
        self.tourney_type_id.is_some()
    }

    /// Check everything that can be checked without the store.
    pub fn validate(&self) -> Result<(), FactError> {
        let (hand_id, player_id) = (self.hand_id, self.player_id);

        let ids = [
            ("hand_id", Some(self.hand_id)),
            ("player_id", Some(self.player_id)),
            ("gametype_id", Some(self.gametype_id)),
            ("tourney_id", self.tourney_id),
            ("tourney_type_id", self.tourney_type_id),
            ("session_id", self.session_id),
        ];
        for (field, id) in ids {
            if id.is_some_and(|v| v < 0) {
                return Err(FactError::NegativeId {
                    hand_id,
                    player_id,
                    field,
                });
            }
        }

        if !(2..=10).contains(&self.seats) {
            return Err(FactError::SeatsOutOfRange {
                hand_id,
                player_id,
                seats: self.seats,
            });
        }
        if self.max_position >= self.seats {
            return Err(FactError::MaxPositionOutOfRange {
                hand_id,
                player_id,
                max_position: self.max_position,
                seats: self.seats,
            });
        }
        if self.tourney_id.is_some() != self.tourney_type_id.is_some() {
            return Err(FactError::TourneyMismatch { hand_id, player_id });
        }

        let counts = self.stats.counts();
        for (column, value) in StatLine::COUNT_COLUMNS.iter().zip(&counts) {
            if *value < 0 {
                return Err(FactError::NegativeCount {
                    hand_id,
                    player_id,
                    column: *column,
                });
            }
        }
        for &(done, chance) in DONE_CHANCE_PAIRS {
            if self.stats.count(done) > self.stats.count(chance) {
                return Err(FactError::DoneExceedsChance {
                    hand_id,
                    player_id,
                    done,
                    chance,
                });
            }
        }
        let amounts = self.stats.amounts();
        for (column, value) in StatLine::AMOUNT_COLUMNS.iter().zip(&amounts) {
            if !value.is_finite() {
                return Err(FactError::NonFiniteAmount {
                    hand_id,
                    player_id,
                    column: *column,
                });
            }
        }
        Ok(())
    }
}

/// A hand as handed over by the importer: its start time and one fact per
/// player dealt in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedHand {
    pub hand_id: HandId,
    pub start_time: DateTime<Utc>,
    pub facts: Vec<HandPlayerFact>,
}

impl ImportedHand {
    /// Validate every fact and the hand-level attributes they share.
    pub fn validate(&self) -> Result<(), FactError> {
        let first = self.facts.first().ok_or(FactError::EmptyHand {
            hand_id: self.hand_id,
        })?;

        for fact in &self.facts {
            if fact.hand_id != self.hand_id {
                return Err(FactError::HandMismatch {
                    expected: self.hand_id,
                    found: fact.hand_id,
                    player_id: fact.player_id,
                });
            }
            fact.validate()?;

            let mismatch = if fact.gametype_id != first.gametype_id {
                Some("gametype_id")
            } else if fact.tourney_id != first.tourney_id {
                Some("tourney_id")
            } else if fact.tourney_type_id != first.tourney_type_id {
                Some("tourney_type_id")
            } else if fact.session_id != first.session_id {
                Some("session_id")
            } else if fact.seats != first.seats {
                Some("seats")
            } else {
                None
            };
            if let Some(field) = mismatch {
                return Err(FactError::InconsistentHand {
                    hand_id: self.hand_id,
                    field,
                });
            }
        }

        let mut players: Vec<PlayerId> = self.facts.iter().map(|f| f.player_id).collect();
        players.sort_unstable();
        if players.windows(2).any(|w| w[0] == w[1]) {
            return Err(FactError::InconsistentHand {
                hand_id: self.hand_id,
                field: "player_id",
            });
        }
        Ok(())
    }

    /// Hand-level attributes, taken from the first fact.
    pub fn gametype_id(&self) -> Option<GametypeId> {
        self.facts.first().map(|f| f.gametype_id)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.facts.first().and_then(|f| f.session_id)
    }
}

/// Hand-level context the key deriver needs beyond the fact itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandContext {
    pub hand_id: HandId,
    pub start_time: DateTime<Utc>,
    pub week_id: WeekId,
    pub month_id: MonthId,
}
