//! Built-in signal sources.
//!
//! Deliberately simple price rules; their job is to feed the ensemble with
//! independent, differently-behaved opinions, not to be good on their own.

use crate::domain::{Action, Signal, StrategyId};

use super::{checked_last, MarketContext, SignalSource, SourceError};

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn vote(
    id: &StrategyId,
    instrument: &str,
    ctx: &MarketContext,
    action: Action,
    confidence: f64,
) -> Result<Signal, SourceError> {
    Signal::new(id.clone(), instrument, ctx.timestamp, action, confidence.clamp(0.0, 1.0))
        .map_err(|e| SourceError::Failed(e.to_string()))
}

// ─── Momentum ────────────────────────────────────────────────────────

/// Rate of change over `lookback` bars: above `threshold` buys, below
/// `-threshold` sells.
#[derive(Debug, Clone)]
pub struct Momentum {
    id: StrategyId,
    lookback: usize,
    threshold: f64,
}

impl Momentum {
    pub fn new(id: StrategyId, lookback: usize, threshold: f64) -> Self {
        Self { id, lookback, threshold }
    }
}

impl SignalSource for Momentum {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn kind(&self) -> &str {
        "momentum"
    }

    fn warmup_bars(&self) -> usize {
        self.lookback + 1
    }

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError> {
        let last = checked_last(instrument, ctx)?;
        if ctx.bars.len() < self.warmup_bars() {
            return Ok(Signal::hold(self.id.clone(), instrument, ctx.timestamp));
        }
        let past = ctx.bars[ctx.bars.len() - 1 - self.lookback].close;
        let roc = last.close / past - 1.0;
        let strength = roc.abs() / self.threshold;
        if roc > self.threshold {
            vote(&self.id, instrument, ctx, Action::Buy, strength / 2.0)
        } else if roc < -self.threshold {
            vote(&self.id, instrument, ctx, Action::Sell, strength / 2.0)
        } else {
            vote(&self.id, instrument, ctx, Action::Hold, 1.0 - strength)
        }
    }
}

// ─── Mean reversion ──────────────────────────────────────────────────

/// Z-score of the close against a `lookback` mean: stretched above `band`
/// sells, stretched below `-band` buys.
#[derive(Debug, Clone)]
pub struct MeanReversion {
    id: StrategyId,
    lookback: usize,
    band: f64,
}

impl MeanReversion {
    pub fn new(id: StrategyId, lookback: usize, band: f64) -> Self {
        Self { id, lookback, band }
    }
}

impl SignalSource for MeanReversion {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn kind(&self) -> &str {
        "mean_reversion"
    }

    fn warmup_bars(&self) -> usize {
        self.lookback
    }

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError> {
        let last = checked_last(instrument, ctx)?;
        if ctx.bars.len() < self.warmup_bars() {
            return Ok(Signal::hold(self.id.clone(), instrument, ctx.timestamp));
        }
        let closes = ctx.closes();
        let window = &closes[closes.len() - self.lookback..];
        let m = mean(window);
        let sd = std_dev(window, m);
        if sd <= f64::EPSILON {
            return vote(&self.id, instrument, ctx, Action::Hold, 1.0);
        }
        let z = (last.close - m) / sd;
        let strength = z.abs() / self.band;
        if z > self.band {
            vote(&self.id, instrument, ctx, Action::Sell, strength / 2.0)
        } else if z < -self.band {
            vote(&self.id, instrument, ctx, Action::Buy, strength / 2.0)
        } else {
            vote(&self.id, instrument, ctx, Action::Hold, 1.0 - strength)
        }
    }
}

// ─── MA crossover ────────────────────────────────────────────────────

/// Fast SMA above slow SMA buys, below sells. Confidence grows with the
/// spread, saturating at 2%.
#[derive(Debug, Clone)]
pub struct MaCrossover {
    id: StrategyId,
    fast: usize,
    slow: usize,
}

impl MaCrossover {
    pub fn new(id: StrategyId, fast: usize, slow: usize) -> Self {
        Self { id, fast, slow }
    }
}

impl SignalSource for MaCrossover {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn kind(&self) -> &str {
        "ma_crossover"
    }

    fn warmup_bars(&self) -> usize {
        self.slow
    }

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError> {
        checked_last(instrument, ctx)?;
        if ctx.bars.len() < self.warmup_bars() {
            return Ok(Signal::hold(self.id.clone(), instrument, ctx.timestamp));
        }
        let closes = ctx.closes();
        let fast = mean(&closes[closes.len() - self.fast..]);
        let slow = mean(&closes[closes.len() - self.slow..]);
        let spread = fast / slow - 1.0;
        let confidence = spread.abs() / 0.02;
        if spread > 0.0 {
            vote(&self.id, instrument, ctx, Action::Buy, confidence)
        } else if spread < 0.0 {
            vote(&self.id, instrument, ctx, Action::Sell, confidence)
        } else {
            vote(&self.id, instrument, ctx, Action::Hold, 1.0)
        }
    }
}

// ─── Breakout ────────────────────────────────────────────────────────

/// Close above the prior `lookback`-bar high buys, below the prior low sells.
#[derive(Debug, Clone)]
pub struct Breakout {
    id: StrategyId,
    lookback: usize,
}

impl Breakout {
    pub fn new(id: StrategyId, lookback: usize) -> Self {
        Self { id, lookback }
    }
}

impl SignalSource for Breakout {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn kind(&self) -> &str {
        "breakout"
    }

    fn warmup_bars(&self) -> usize {
        self.lookback + 1
    }

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError> {
        let last = checked_last(instrument, ctx)?;
        if ctx.bars.len() < self.warmup_bars() {
            return Ok(Signal::hold(self.id.clone(), instrument, ctx.timestamp));
        }
        let end = ctx.bars.len() - 1;
        let prior = &ctx.bars[end - self.lookback..end];
        let high = prior.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = prior.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        if last.close > high {
            let excess = last.close / high - 1.0;
            vote(&self.id, instrument, ctx, Action::Buy, 0.5 + excess * 25.0)
        } else if last.close < low {
            let excess = 1.0 - last.close / low;
            vote(&self.id, instrument, ctx, Action::Sell, 0.5 + excess * 25.0)
        } else {
            vote(&self.id, instrument, ctx, Action::Hold, 0.2)
        }
    }
}
