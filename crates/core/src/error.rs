// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

use crate::fact::{HandId, PlayerId, SessionId};

/// Reasons a fact is rejected before anything is written.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactError {
    #[error("hand {hand_id} has no player facts")]
    EmptyHand { hand_id: HandId },

    #[error("fact for player {player_id} names hand {found}, imported with hand {expected}")]
    HandMismatch {
        expected: HandId,
        found: HandId,
        player_id: PlayerId,
    },

    #[error("facts of hand {hand_id} disagree on {field}")]
    InconsistentHand {
        hand_id: HandId,
        field: &'static str,
    },

    #[error("hand {hand_id} player {player_id}: {field} is negative")]
    NegativeId {
        hand_id: HandId,
        player_id: PlayerId,
        field: &'static str,
    },

    #[error("hand {hand_id} player {player_id}: seats {seats} outside 2..=10")]
    SeatsOutOfRange {
        hand_id: HandId,
        player_id: PlayerId,
        seats: u8,
    },

    #[error("hand {hand_id} player {player_id}: max position {max_position} not below seats {seats}")]
    MaxPositionOutOfRange {
        hand_id: HandId,
        player_id: PlayerId,
        max_position: u8,
        seats: u8,
    },

    #[error("invalid table position {position:?} (expected B, S or a digit)")]
    InvalidPosition { position: String },

    #[error("hand {hand_id} player {player_id}: tourney id and tourney type id must be set together")]
    TourneyMismatch {
        hand_id: HandId,
        player_id: PlayerId,
    },

    #[error("hand {hand_id} player {player_id}: {column} is negative")]
    NegativeCount {
        hand_id: HandId,
        player_id: PlayerId,
        column: &'static str,
    },

    #[error("hand {hand_id} player {player_id}: {done} exceeds {chance}")]
    DoneExceedsChance {
        hand_id: HandId,
        player_id: PlayerId,
        done: &'static str,
        chance: &'static str,
    },

    #[error("hand {hand_id} player {player_id}: {column} is not a finite number")]
    NonFiniteAmount {
        hand_id: HandId,
        player_id: PlayerId,
        column: &'static str,
    },

    #[error("fact for hand {hand_id} player {player_id} is already recorded")]
    AlreadyRecorded { hand_id: HandId, player_id: PlayerId },

    #[error("hand {hand_id} references unknown session {session_id}")]
    UnknownSession {
        hand_id: HandId,
        session_id: SessionId,
    },
}

impl FactError {
    /// The hand a rejected fact belonged to, when known.
    pub fn hand_id(&self) -> Option<HandId> {
        match self {
            Self::EmptyHand { hand_id }
            | Self::InconsistentHand { hand_id, .. }
            | Self::NegativeId { hand_id, .. }
            | Self::SeatsOutOfRange { hand_id, .. }
            | Self::MaxPositionOutOfRange { hand_id, .. }
            | Self::TourneyMismatch { hand_id, .. }
            | Self::NegativeCount { hand_id, .. }
            | Self::DoneExceedsChance { hand_id, .. }
            | Self::NonFiniteAmount { hand_id, .. }
            | Self::AlreadyRecorded { hand_id, .. }
            | Self::UnknownSession { hand_id, .. } => Some(*hand_id),
            Self::HandMismatch { expected, .. } => Some(*expected),
            Self::InvalidPosition { .. } => None,
        }
    }
}

/// Errors resolving a raw timestamp into a time bucket.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimestampError {
    #[error("timestamp is missing")]
    Missing,

    #[error("unparseable timestamp {input:?}")]
    Unparseable { input: String },

    #[error("timestamp {input:?} is outside the supported range")]
    OutOfRange { input: String },
}

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Failed to determine cache directory")]
    NoCacheDir,
}
