//! Strategy signal sources: the black-box producers of per-tick votes.
//!
//! Sources see only market data for one instrument. They never touch ranking
//! state, performance scores, or other strategies' signals.

pub mod builtin;
pub mod factory;

use thiserror::Error;

use crate::domain::{Bar, Signal, StrategyId, Symbol, Timestamp};

pub use builtin::{Breakout, MaCrossover, MeanReversion, Momentum};
pub use factory::{create_source, FactoryError};

/// Failures a source may report instead of a signal. Any error makes the
/// strategy abstain for that tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("no market data for '{0}'")]
    NoData(Symbol),
    #[error("invalid market data for '{instrument}': {reason}")]
    InvalidData { instrument: Symbol, reason: String },
    #[error("source failed: {0}")]
    Failed(String),
}

/// Market data visible to a source at one tick: the instrument's bar history
/// up to and including the current bar.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub instrument: Symbol,
    pub timestamp: Timestamp,
    pub bars: Vec<Bar>,
}

impl MarketContext {
    pub fn new(instrument: impl Into<Symbol>, timestamp: Timestamp, bars: Vec<Bar>) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            bars,
        }
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }
}

/// Fixed capability interface every strategy implements.
pub trait SignalSource: Send + Sync {
    /// Stable id this source signs its signals with.
    fn id(&self) -> &StrategyId;

    /// Factory kind (e.g. "momentum").
    fn kind(&self) -> &str;

    /// Bars needed before the source can vote; with fewer it holds at zero
    /// confidence.
    fn warmup_bars(&self) -> usize;

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError>;
}

/// Shared pre-checks for the built-in sources: the current bar must exist
/// and be sane.
pub(crate) fn checked_last<'a>(instrument: &str, ctx: &'a MarketContext) -> Result<&'a Bar, SourceError> {
    let bar = ctx
        .last()
        .ok_or_else(|| SourceError::NoData(instrument.to_string()))?;
    if !bar.is_sane() {
        return Err(SourceError::InvalidData {
            instrument: instrument.to_string(),
            reason: format!("bar at {} failed OHLC sanity check", bar.timestamp),
        });
    }
    Ok(bar)
}
