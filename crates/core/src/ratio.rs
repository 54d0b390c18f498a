// crates/core/src/ratio.rs
//! Read-time ratios over aggregate sums.
//!
//! Ratios are never persisted. A ratio over zero opportunities is
//! [`Ratio::NoData`], which is distinct from a computed zero.

use serde::Serialize;

use crate::stats::AggregateRow;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum Ratio {
    Value(f64),
    NoData,
}

impl Ratio {
    /// `done / chance`, or `NoData` when there was no opportunity.
    pub fn of(done: i64, chance: i64) -> Self {
        if chance <= 0 {
            Ratio::NoData
        } else {
            Ratio::Value(done as f64 / chance as f64)
        }
    }

    fn of_amount(amount: f64, per: i64) -> Self {
        if per <= 0 {
            Ratio::NoData
        } else {
            Ratio::Value(amount / per as f64)
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Ratio::Value(v) => Some(*v),
            Ratio::NoData => None,
        }
    }

    /// As a percentage rounded to one decimal place.
    pub fn percent(&self) -> Option<f64> {
        self.value().map(|v| (v * 1000.0).round() / 10.0)
    }
}

/// Postflop street, 1 (flop) through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Street {
    Flop = 1,
    Turn = 2,
    River = 3,
    Seventh = 4,
}

impl AggregateRow {
    pub fn vpip(&self) -> Ratio {
        Ratio::of(self.stats.street0_vpi, self.stats.street0_vpi_chance)
    }

    pub fn pfr(&self) -> Ratio {
        Ratio::of(self.stats.street0_aggr, self.stats.street0_aggr_chance)
    }

    pub fn three_bet(&self) -> Ratio {
        Ratio::of(self.stats.street0_3b_done, self.stats.street0_3b_chance)
    }

    pub fn four_bet(&self) -> Ratio {
        Ratio::of(self.stats.street0_4b_done, self.stats.street0_4b_chance)
    }

    pub fn squeeze(&self) -> Ratio {
        Ratio::of(self.stats.street0_squeeze_done, self.stats.street0_squeeze_chance)
    }

    pub fn fold_to_three_bet(&self) -> Ratio {
        Ratio::of(
            self.stats.street0_fold_to_3b_done,
            self.stats.street0_fold_to_3b_chance,
        )
    }

    pub fn steal(&self) -> Ratio {
        Ratio::of(self.stats.steal_done, self.stats.steal_chance)
    }

    /// Went to showdown when seeing the flop.
    pub fn wtsd(&self) -> Ratio {
        Ratio::of(self.stats.saw_showdown, self.stats.street1_seen)
    }

    /// Won money at showdown.
    pub fn w_sd(&self) -> Ratio {
        Ratio::of(self.stats.won_at_sd, self.stats.saw_showdown)
    }

    pub fn cbet(&self, street: Street) -> Ratio {
        let s = &self.stats;
        match street {
            Street::Flop => Ratio::of(s.street1_cb_done, s.street1_cb_chance),
            Street::Turn => Ratio::of(s.street2_cb_done, s.street2_cb_chance),
            Street::River => Ratio::of(s.street3_cb_done, s.street3_cb_chance),
            Street::Seventh => Ratio::of(s.street4_cb_done, s.street4_cb_chance),
        }
    }

    pub fn fold_to_cbet(&self, street: Street) -> Ratio {
        let s = &self.stats;
        match street {
            Street::Flop => Ratio::of(s.street1_fold_to_cb_done, s.street1_fold_to_cb_chance),
            Street::Turn => Ratio::of(s.street2_fold_to_cb_done, s.street2_fold_to_cb_chance),
            Street::River => Ratio::of(s.street3_fold_to_cb_done, s.street3_fold_to_cb_chance),
            Street::Seventh => Ratio::of(s.street4_fold_to_cb_done, s.street4_fold_to_cb_chance),
        }
    }

    /// Postflop aggression frequency: aggressive streets over streets seen.
    pub fn aggression_frequency(&self) -> Ratio {
        let s = &self.stats;
        Ratio::of(
            s.street1_aggr + s.street2_aggr + s.street3_aggr + s.street4_aggr,
            s.street1_seen + s.street2_seen + s.street3_seen + s.street4_seen,
        )
    }

    /// Postflop aggression factor: bets plus raises per call. Not bounded by 1.
    pub fn aggression_factor(&self) -> Ratio {
        let s = &self.stats;
        let aggressive = s.street1_bets
            + s.street2_bets
            + s.street3_bets
            + s.street4_bets
            + s.street1_raises
            + s.street2_raises
            + s.street3_raises
            + s.street4_raises;
        let calls = s.street1_calls + s.street2_calls + s.street3_calls + s.street4_calls;
        Ratio::of(aggressive, calls)
    }

    /// Profit per hundred hands.
    pub fn profit_per_100(&self) -> Ratio {
        Ratio::of_amount(self.stats.total_profit * 100.0, self.n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatLine;

    #[test]
    fn test_zero_chance_is_no_data_not_zero() {
        let row = AggregateRow::default();
        assert_eq!(row.vpip(), Ratio::NoData);
        assert_eq!(row.vpip().percent(), None);

        let mut row = AggregateRow::from_stats(&StatLine::default());
        row.stats.street0_vpi_chance = 4;
        assert_eq!(row.vpip(), Ratio::Value(0.0));
    }

    #[test]
    fn test_vpip_fifty_percent() {
        let mut row = AggregateRow::from_stats(&StatLine {
            street0_vpi_chance: 1,
            street0_vpi: 1,
            ..Default::default()
        });
        row.merge(&AggregateRow::from_stats(&StatLine {
            street0_vpi_chance: 1,
            ..Default::default()
        }));
        assert_eq!(row.vpip().percent(), Some(50.0));
    }

    #[test]
    fn test_aggression_factor_can_exceed_one() {
        let row = AggregateRow::from_stats(&StatLine {
            street1_bets: 2,
            street2_raises: 1,
            street1_calls: 1,
            ..Default::default()
        });
        assert_eq!(row.aggression_factor(), Ratio::Value(3.0));
    }

    #[test]
    fn test_profit_per_100() {
        let row = AggregateRow {
            n: 200,
            stats: StatLine {
                total_profit: 50.0,
                ..Default::default()
            },
        };
        assert_eq!(row.profit_per_100(), Ratio::Value(25.0));
    }

    #[test]
    fn test_ratio_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Ratio::NoData).unwrap();
        assert_eq!(json, r#"{"kind":"noData"}"#);
        let json = serde_json::to_string(&Ratio::Value(0.5)).unwrap();
        assert_eq!(json, r#"{"kind":"value","value":0.5}"#);
    }
}
