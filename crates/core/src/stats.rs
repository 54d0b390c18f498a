// crates/core/src/stats.rs
//! The stat catalog.
//!
//! Every counter a [`HandPlayerFact`](crate::HandPlayerFact) carries, and that
//! every rollup table sums, is declared exactly once in the `stat_line!` block
//! below. The macro generates [`StatLine`] together with its column lists,
//! summation and row decoding, so the rollup schema, the fact log and the
//! rebuild comparison never spell out individual columns.
//!
//! Two kinds of column exist:
//! - *counts* (`i64`): opportunity/execution counters and action tallies,
//!   compared exactly.
//! - *amounts* (`f64`): money and equity sums, compared with a tolerance.

use serde::{Deserialize, Serialize};

macro_rules! stat_line {
    (
        counts { $($count:ident),* $(,)? }
        amounts { $($amount:ident),* $(,)? }
    ) => {
        /// Per-fact counters. Also the running sums stored in an aggregate row.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct StatLine {
            $(pub $count: i64,)*
            $(pub $amount: f64,)*
        }

        impl StatLine {
            /// Integer counter columns, in declaration order.
            pub const COUNT_COLUMNS: &'static [&'static str] = &[$(stringify!($count)),*];
            /// Monetary/EV columns, in declaration order.
            pub const AMOUNT_COLUMNS: &'static [&'static str] = &[$(stringify!($amount)),*];

            /// Count values aligned with [`Self::COUNT_COLUMNS`].
            pub fn counts(&self) -> Vec<i64> {
                vec![$(self.$count),*]
            }

            /// Amount values aligned with [`Self::AMOUNT_COLUMNS`].
            pub fn amounts(&self) -> Vec<f64> {
                vec![$(self.$amount),*]
            }

            pub fn count(&self, column: &str) -> Option<i64> {
                match column {
                    $(stringify!($count) => Some(self.$count),)*
                    _ => None,
                }
            }

            pub fn amount(&self, column: &str) -> Option<f64> {
                match column {
                    $(stringify!($amount) => Some(self.$amount),)*
                    _ => None,
                }
            }

            /// Set a count by column name. Returns `false` for unknown columns.
            pub fn set_count(&mut self, column: &str, value: i64) -> bool {
                match column {
                    $(stringify!($count) => {
                        self.$count = value;
                        true
                    })*
                    _ => false,
                }
            }

            /// Set an amount by column name. Returns `false` for unknown columns.
            pub fn set_amount(&mut self, column: &str, value: f64) -> bool {
                match column {
                    $(stringify!($amount) => {
                        self.$amount = value;
                        true
                    })*
                    _ => false,
                }
            }

            /// Add every counter of `other` onto `self`.
            pub fn merge(&mut self, other: &StatLine) {
                $(self.$count += other.$count;)*
                $(self.$amount += other.$amount;)*
            }

            /// Build a line by pulling each column through the given getters.
            /// Used to decode database rows without naming columns.
            pub fn try_from_columns<E>(
                mut count: impl FnMut(&'static str) -> Result<i64, E>,
                mut amount: impl FnMut(&'static str) -> Result<f64, E>,
            ) -> Result<Self, E> {
                Ok(Self {
                    $($count: count(stringify!($count))?,)*
                    $($amount: amount(stringify!($amount))?,)*
                })
            }
        }
    };
}

stat_line! {
    counts {
        // preflop
        street0_vpi_chance,
        street0_vpi,
        street0_aggr_chance,
        street0_aggr,
        street0_called_raise_chance,
        street0_called_raise_done,
        street0_3b_chance,
        street0_3b_done,
        street0_4b_chance,
        street0_4b_done,
        street0_c4b_chance,
        street0_c4b_done,
        street0_5b_chance,
        street0_5b_done,
        street0_squeeze_chance,
        street0_squeeze_done,
        street0_fold_to_3b_chance,
        street0_fold_to_3b_done,
        street0_fold_to_4b_chance,
        street0_fold_to_4b_done,
        street0_fold_to_squeeze_chance,
        street0_fold_to_squeeze_done,
        raise_first_in_chance,
        raised_first_in,
        steal_chance,
        steal_done,
        success_steal,
        fold_bb_to_steal_chance,
        folded_bb_to_steal,
        fold_sb_to_steal_chance,
        folded_sb_to_steal,
        // streets reached
        street1_seen,
        street2_seen,
        street3_seen,
        street4_seen,
        saw_showdown,
        won_at_sd,
        // postflop aggression
        street1_aggr,
        street2_aggr,
        street3_aggr,
        street4_aggr,
        street1_other_raised,
        street2_other_raised,
        street3_other_raised,
        street4_other_raised,
        street1_fold_to_other_raised,
        street2_fold_to_other_raised,
        street3_fold_to_other_raised,
        street4_fold_to_other_raised,
        // continuation bets
        street1_cb_chance,
        street1_cb_done,
        street2_cb_chance,
        street2_cb_done,
        street3_cb_chance,
        street3_cb_done,
        street4_cb_chance,
        street4_cb_done,
        street1_fold_to_cb_chance,
        street1_fold_to_cb_done,
        street2_fold_to_cb_chance,
        street2_fold_to_cb_done,
        street3_fold_to_cb_chance,
        street3_fold_to_cb_done,
        street4_fold_to_cb_chance,
        street4_fold_to_cb_done,
        // check-call / check-raise
        street1_check_call_raise_chance,
        street1_check_call_done,
        street1_check_raise_done,
        street2_check_call_raise_chance,
        street2_check_call_done,
        street2_check_raise_done,
        street3_check_call_raise_chance,
        street3_check_call_done,
        street3_check_raise_done,
        street4_check_call_raise_chance,
        street4_check_call_done,
        street4_check_raise_done,
        // winners
        won_when_seen_street1,
        won_when_seen_street2,
        won_when_seen_street3,
        won_when_seen_street4,
        // action tallies
        street0_calls,
        street1_calls,
        street2_calls,
        street3_calls,
        street4_calls,
        street0_bets,
        street1_bets,
        street2_bets,
        street3_bets,
        street4_bets,
        street0_raises,
        street1_raises,
        street2_raises,
        street3_raises,
        street4_raises,
    }
    amounts {
        committed,
        winnings,
        rake,
        rake_dealt,
        rake_contributed,
        total_profit,
        showdown_winnings,
        non_showdown_winnings,
        all_in_ev,
    }
}

/// `(done, chance)` pairs: within a single fact the done counter can never
/// exceed its opportunity counter.
pub const DONE_CHANCE_PAIRS: &[(&str, &str)] = &[
    ("street0_vpi", "street0_vpi_chance"),
    ("street0_aggr", "street0_aggr_chance"),
    ("street0_called_raise_done", "street0_called_raise_chance"),
    ("street0_3b_done", "street0_3b_chance"),
    ("street0_4b_done", "street0_4b_chance"),
    ("street0_c4b_done", "street0_c4b_chance"),
    ("street0_5b_done", "street0_5b_chance"),
    ("street0_squeeze_done", "street0_squeeze_chance"),
    ("street0_fold_to_3b_done", "street0_fold_to_3b_chance"),
    ("street0_fold_to_4b_done", "street0_fold_to_4b_chance"),
    ("street0_fold_to_squeeze_done", "street0_fold_to_squeeze_chance"),
    ("raised_first_in", "raise_first_in_chance"),
    ("steal_done", "steal_chance"),
    ("success_steal", "steal_done"),
    ("folded_bb_to_steal", "fold_bb_to_steal_chance"),
    ("folded_sb_to_steal", "fold_sb_to_steal_chance"),
    ("won_at_sd", "saw_showdown"),
    ("street1_fold_to_other_raised", "street1_other_raised"),
    ("street2_fold_to_other_raised", "street2_other_raised"),
    ("street3_fold_to_other_raised", "street3_other_raised"),
    ("street4_fold_to_other_raised", "street4_other_raised"),
    ("street1_cb_done", "street1_cb_chance"),
    ("street2_cb_done", "street2_cb_chance"),
    ("street3_cb_done", "street3_cb_chance"),
    ("street4_cb_done", "street4_cb_chance"),
    ("street1_fold_to_cb_done", "street1_fold_to_cb_chance"),
    ("street2_fold_to_cb_done", "street2_fold_to_cb_chance"),
    ("street3_fold_to_cb_done", "street3_fold_to_cb_chance"),
    ("street4_fold_to_cb_done", "street4_fold_to_cb_chance"),
    ("street1_check_call_done", "street1_check_call_raise_chance"),
    ("street1_check_raise_done", "street1_check_call_raise_chance"),
    ("street2_check_call_done", "street2_check_call_raise_chance"),
    ("street2_check_raise_done", "street2_check_call_raise_chance"),
    ("street3_check_call_done", "street3_check_call_raise_chance"),
    ("street3_check_raise_done", "street3_check_call_raise_chance"),
    ("street4_check_call_done", "street4_check_call_raise_chance"),
    ("street4_check_raise_done", "street4_check_call_raise_chance"),
    ("won_when_seen_street1", "street1_seen"),
    ("won_when_seen_street2", "street2_seen"),
    ("won_when_seen_street3", "street3_seen"),
    ("won_when_seen_street4", "street4_seen"),
];

/// Running sums for one (table, key): the number of facts folded in plus
/// the summed [`StatLine`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub n: i64,
    pub stats: StatLine,
}

impl AggregateRow {
    /// A row seeded from a single fact's counters.
    pub fn from_stats(stats: &StatLine) -> Self {
        Self {
            n: 1,
            stats: stats.clone(),
        }
    }

    /// Fold another row (or a single fact) into this one.
    pub fn merge(&mut self, other: &AggregateRow) {
        self.n += other.n;
        self.stats.merge(&other.stats);
    }

    /// Column names on which `self` and `other` differ: `n` and counts
    /// exactly, amounts beyond `tolerance`.
    pub fn divergence(&self, other: &AggregateRow, tolerance: f64) -> Vec<&'static str> {
        let mut diverged = Vec::new();
        if self.n != other.n {
            diverged.push("n");
        }
        let pairs = self.stats.counts().into_iter().zip(other.stats.counts());
        for (column, (a, b)) in StatLine::COUNT_COLUMNS.iter().zip(pairs) {
            if a != b {
                diverged.push(*column);
            }
        }
        let pairs = self.stats.amounts().into_iter().zip(other.stats.amounts());
        for (column, (a, b)) in StatLine::AMOUNT_COLUMNS.iter().zip(pairs) {
            if (a - b).abs() > tolerance {
                diverged.push(*column);
            }
        }
        diverged
    }
}
