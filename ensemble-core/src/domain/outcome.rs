//! Outcome samples: the realized result used to judge a past signal.

use serde::{Deserialize, Serialize};

use super::{Action, Signal, StrategyId, Symbol, Timestamp};

/// Immutable, append-only record of how a signal played out.
///
/// `realized_return` is direction-adjusted: positive means following the
/// signal made money (BUY then price rose, SELL then price fell).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub strategy_id: StrategyId,
    pub instrument: Symbol,
    pub signal_timestamp: Timestamp,
    pub realized_return: f64,
}

impl OutcomeSample {
    /// Realize a signal against its entry and exit prices.
    ///
    /// Returns `None` for HOLD signals (nothing was risked, nothing to judge)
    /// and for non-positive or non-finite entry prices.
    pub fn realize(signal: &Signal, entry_price: f64, exit_price: f64) -> Option<Self> {
        if signal.action == Action::Hold {
            return None;
        }
        if !(entry_price.is_finite() && entry_price > 0.0 && exit_price.is_finite()) {
            return None;
        }
        let raw = exit_price / entry_price - 1.0;
        Some(Self {
            strategy_id: signal.strategy_id.clone(),
            instrument: signal.instrument.clone(),
            signal_timestamp: signal.timestamp,
            realized_return: raw * signal.action.direction(),
        })
    }

    /// Hit/miss indicator: +1 for a profitable signal, -1 for a losing one,
    /// 0 when the price did not move.
    pub fn indicator(&self) -> f64 {
        if self.realized_return > 0.0 {
            1.0
        } else if self.realized_return < 0.0 {
            -1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn signal(action: Action) -> Signal {
        Signal::new(
            "macd".into(),
            "MSFT",
            Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap(),
            action,
            0.8,
        )
        .unwrap()
    }

    #[test]
    fn buy_profits_when_price_rises() {
        let s = OutcomeSample::realize(&signal(Action::Buy), 100.0, 110.0).unwrap();
        assert!((s.realized_return - 0.10).abs() < 1e-12);
        assert_eq!(s.indicator(), 1.0);
    }

    #[test]
    fn sell_profits_when_price_falls() {
        let s = OutcomeSample::realize(&signal(Action::Sell), 100.0, 95.0).unwrap();
        assert!((s.realized_return - 0.05).abs() < 1e-12);
        assert_eq!(s.indicator(), 1.0);
    }

    #[test]
    fn sell_loses_when_price_rises() {
        let s = OutcomeSample::realize(&signal(Action::Sell), 100.0, 102.0).unwrap();
        assert!(s.realized_return < 0.0);
        assert_eq!(s.indicator(), -1.0);
    }

    #[test]
    fn hold_produces_no_sample() {
        assert!(OutcomeSample::realize(&signal(Action::Hold), 100.0, 120.0).is_none());
    }

    #[test]
    fn flat_price_is_neutral() {
        let s = OutcomeSample::realize(&signal(Action::Buy), 50.0, 50.0).unwrap();
        assert_eq!(s.indicator(), 0.0);
    }

    #[test]
    fn bad_entry_price_produces_no_sample() {
        assert!(OutcomeSample::realize(&signal(Action::Buy), 0.0, 50.0).is_none());
        assert!(OutcomeSample::realize(&signal(Action::Buy), f64::NAN, 50.0).is_none());
    }
}
