//! Performance Tracker: recency-weighted strategy scores.
//!
//! Each strategy keeps O(1) state: its decayed score and the timestamp of the
//! last sample folded into it. A new sample updates the score as
//!
//! ```text
//! score' = score * exp(-Δt / half_life) + contribution(sample)
//! contribution = hit_weight * indicator * tier(|r|) + return_weight * clip(r)
//! ```
//!
//! where Δt is measured between signal timestamps, never against wall-clock
//! time, so replaying the same samples always yields the same scores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::config::DecayConfig;
use crate::domain::{OutcomeSample, StrategyId, Symbol, Timestamp};
use crate::ranking::StrategyScore;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidSample {
    #[error("signal timestamp {signal} is in the future (now {now})")]
    FutureTimestamp { signal: Timestamp, now: Timestamp },
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(StrategyId),
    #[error("unknown instrument '{0}'")]
    UnknownInstrument(Symbol),
    #[error("sample for '{strategy}' at {signal} predates its last update {last}")]
    OutOfOrder {
        strategy: StrategyId,
        signal: Timestamp,
        last: Timestamp,
    },
    #[error("realized return is not finite: {0}")]
    NonFiniteReturn(f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error("invalid outcome sample: {0}")]
    InvalidSample(#[from] InvalidSample),
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(StrategyId),
}

// ─── Score state ─────────────────────────────────────────────────────

/// Per-strategy performance record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreState {
    pub score: f64,
    pub last_update: Option<Timestamp>,
    pub sample_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub neutral: u64,
}

impl ScoreState {
    pub fn hit_rate(&self) -> Option<f64> {
        let decided = self.hits + self.misses;
        (decided > 0).then(|| self.hits as f64 / decided as f64)
    }

    fn fold(&mut self, sample: &OutcomeSample, decay: &DecayConfig) {
        let factor = match self.last_update {
            Some(last) => decay_factor(seconds_between(last, sample.signal_timestamp), decay),
            None => 0.0,
        };
        self.score = self.score * factor + contribution(sample, decay);
        self.last_update = Some(sample.signal_timestamp);
        self.sample_count += 1;
        match sample.indicator() {
            i if i > 0.0 => self.hits += 1,
            i if i < 0.0 => self.misses += 1,
            _ => self.neutral += 1,
        }
    }

    /// Score decayed forward to `at`. Instants before `last_update` do not
    /// grow the score back.
    pub fn decayed_to(&self, at: Timestamp, decay: &DecayConfig) -> f64 {
        match self.last_update {
            Some(last) => self.score * decay_factor(seconds_between(last, at).max(0.0), decay),
            None => decay.neutral_score,
        }
    }
}

/// Persisted form of every strategy's record.
pub type ScoreBoard = BTreeMap<StrategyId, ScoreState>;

fn seconds_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn decay_factor(dt_secs: f64, decay: &DecayConfig) -> f64 {
    (-dt_secs / decay.half_life_secs).exp()
}

/// One sample's additive contribution to a score.
pub fn contribution(sample: &OutcomeSample, decay: &DecayConfig) -> f64 {
    let r = sample.realized_return;
    let clipped = r.clamp(-decay.return_clip, decay.return_clip);
    decay.hit_weight * sample.indicator() * decay.tier_multiplier(r) + decay.return_weight * clipped
}

/// Batch recomputation of one strategy's score from its full sample history
/// (in arrival order): each contribution decayed from its own timestamp to
/// the last one. Used to audit the incremental state.
pub fn replay_score(samples: &[OutcomeSample], decay: &DecayConfig) -> f64 {
    let Some(last) = samples.last() else {
        return decay.neutral_score;
    };
    samples
        .iter()
        .map(|s| {
            contribution(s, decay)
                * decay_factor(seconds_between(s.signal_timestamp, last.signal_timestamp), decay)
        })
        .sum()
}

// ─── Tracker ─────────────────────────────────────────────────────────

pub struct PerformanceTracker {
    decay: DecayConfig,
    universe: BTreeSet<Symbol>,
    states: ScoreBoard,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("decay", &self.decay)
            .field("universe", &self.universe)
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl PerformanceTracker {
    pub fn new(
        decay: DecayConfig,
        universe: impl IntoIterator<Item = Symbol>,
        strategies: impl IntoIterator<Item = StrategyId>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            decay,
            universe: universe.into_iter().collect(),
            states: strategies
                .into_iter()
                .map(|id| (id, ScoreState::default()))
                .collect(),
            clock,
        }
    }

    /// Restore a tracker by replaying an outcome log.
    pub fn rebuild<'a>(
        decay: DecayConfig,
        universe: impl IntoIterator<Item = Symbol>,
        strategies: impl IntoIterator<Item = StrategyId>,
        clock: Arc<dyn Clock>,
        samples: impl IntoIterator<Item = &'a OutcomeSample>,
    ) -> Result<Self, TrackerError> {
        let mut tracker = Self::new(decay, universe, strategies, clock);
        for sample in samples {
            tracker.record_outcome(sample)?;
        }
        Ok(tracker)
    }

    /// Add a strategy registered after construction. Existing history is kept.
    pub fn register(&mut self, id: StrategyId) {
        self.states.entry(id).or_default();
    }

    /// Run every admission check without touching state.
    pub fn check(&self, sample: &OutcomeSample) -> Result<(), InvalidSample> {
        let Some(state) = self.states.get(&sample.strategy_id) else {
            return Err(InvalidSample::UnknownStrategy(sample.strategy_id.clone()));
        };
        if !self.universe.contains(&sample.instrument) {
            return Err(InvalidSample::UnknownInstrument(sample.instrument.clone()));
        }
        if !sample.realized_return.is_finite() {
            return Err(InvalidSample::NonFiniteReturn(sample.realized_return));
        }
        let now = self.clock.now();
        if sample.signal_timestamp > now {
            return Err(InvalidSample::FutureTimestamp {
                signal: sample.signal_timestamp,
                now,
            });
        }
        if let Some(last) = state.last_update {
            if sample.signal_timestamp < last {
                return Err(InvalidSample::OutOfOrder {
                    strategy: sample.strategy_id.clone(),
                    signal: sample.signal_timestamp,
                    last,
                });
            }
        }
        Ok(())
    }

    /// Fold one outcome into its strategy's score. Returns the new score.
    pub fn record_outcome(&mut self, sample: &OutcomeSample) -> Result<f64, TrackerError> {
        self.check(sample)?;
        let decay = &self.decay;
        let state = self
            .states
            .get_mut(&sample.strategy_id)
            .ok_or_else(|| TrackerError::UnknownStrategy(sample.strategy_id.clone()))?;
        state.fold(sample, decay);
        debug!(
            strategy = %sample.strategy_id,
            instrument = %sample.instrument,
            realized_return = sample.realized_return,
            score = state.score,
            "outcome recorded"
        );
        Ok(state.score)
    }

    /// Score as of the strategy's last sample, or the neutral default.
    pub fn current_score(&self, id: &StrategyId) -> Result<f64, TrackerError> {
        let state = self
            .states
            .get(id)
            .ok_or_else(|| TrackerError::UnknownStrategy(id.clone()))?;
        Ok(if state.sample_count == 0 {
            self.decay.neutral_score
        } else {
            state.score
        })
    }

    /// Every score decayed to a common instant, ready for ranking.
    pub fn scores_as_of(&self, at: Timestamp) -> BTreeMap<StrategyId, StrategyScore> {
        self.states
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    StrategyScore {
                        value: state.decayed_to(at, &self.decay),
                        sample_count: state.sample_count,
                    },
                )
            })
            .collect()
    }

    pub fn state(&self, id: &StrategyId) -> Option<&ScoreState> {
        self.states.get(id)
    }

    pub fn board(&self) -> &ScoreBoard {
        &self.states
    }

    pub fn decay(&self) -> &DecayConfig {
        &self.decay
    }
}
