//! Signals: a strategy's directional opinion on one instrument at one tick.
//!
//! Signals are immutable once produced. A strategy emits at most one signal
//! per instrument per tick; the aggregator ignores any duplicates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{StrategyId, Symbol, Timestamp};

/// Directional action voted by a strategy or chosen by the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Direction multiplier applied to a raw price return.
    ///
    /// BUY profits when price rises, SELL when it falls, HOLD takes no side.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Hold => 0.0,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Hold)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        };
        f.write_str(s)
    }
}

/// Reasons a signal is rejected at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("instrument symbol is empty")]
    EmptyInstrument,
}

/// An immutable directional vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: StrategyId,
    pub instrument: Symbol,
    pub timestamp: Timestamp,
    pub action: Action,
    /// Conviction in `[0, 1]`.
    pub confidence: f64,
}

impl Signal {
    pub fn new(
        strategy_id: StrategyId,
        instrument: impl Into<Symbol>,
        timestamp: Timestamp,
        action: Action,
        confidence: f64,
    ) -> Result<Self, SignalError> {
        let instrument = instrument.into();
        if instrument.is_empty() {
            return Err(SignalError::EmptyInstrument);
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(SignalError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            strategy_id,
            instrument,
            timestamp,
            action,
            confidence,
        })
    }

    /// Convenience constructor for an abstaining HOLD vote with zero confidence.
    pub fn hold(strategy_id: StrategyId, instrument: impl Into<Symbol>, timestamp: Timestamp) -> Self {
        Self {
            strategy_id,
            instrument: instrument.into(),
            timestamp,
            action: Action::Hold,
            confidence: 0.0,
        }
    }

    /// Deserialized or hand-built signals bypass `new`; callers that receive
    /// signals from outside the crate re-check with this.
    pub fn is_well_formed(&self) -> bool {
        !self.instrument.is_empty() && (0.0..=1.0).contains(&self.confidence)
    }
}
