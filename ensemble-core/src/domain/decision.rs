//! Ensemble decisions: derived per tick, never a source of truth.

use serde::{Deserialize, Serialize};

use super::{Action, SnapshotVersion, StrategyId, Symbol, Timestamp};

/// Weighted vote totals per action category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionScores {
    pub buy: f64,
    pub sell: f64,
    pub hold: f64,
}

impl ActionScores {
    pub fn get(&self, action: Action) -> f64 {
        match action {
            Action::Buy => self.buy,
            Action::Sell => self.sell,
            Action::Hold => self.hold,
        }
    }

    pub fn add(&mut self, action: Action, amount: f64) {
        match action {
            Action::Buy => self.buy += amount,
            Action::Sell => self.sell += amount,
            Action::Hold => self.hold += amount,
        }
    }

    pub fn total(&self) -> f64 {
        self.buy + self.sell + self.hold
    }
}

/// One strategy's share in the winning vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub strategy_id: StrategyId,
    pub weight: f64,
    pub confidence: f64,
}

/// The single action taken for one instrument at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub instrument: Symbol,
    pub timestamp: Timestamp,
    pub action: Action,
    /// Weighted score of the winning action.
    pub aggregate_score: f64,
    pub scores: ActionScores,
    /// Strategies whose vote matched the winning action, with their weights.
    pub contributing_strategies: Vec<Contribution>,
    /// Fraction of the total weighted vote behind a BUY/SELL; 0 for HOLD.
    pub sizing_hint: f64,
    /// Snapshot the decision was weighted by; `None` when no snapshot existed.
    pub snapshot_version: Option<SnapshotVersion>,
}

impl EnsembleDecision {
    /// Fail-closed decision used when no finalized snapshot is available.
    pub fn fail_closed(instrument: impl Into<Symbol>, timestamp: Timestamp) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            action: Action::Hold,
            aggregate_score: 0.0,
            scores: ActionScores::default(),
            contributing_strategies: Vec::new(),
            sizing_hint: 0.0,
            snapshot_version: None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !self.action.is_hold()
    }

    pub fn contributors(&self) -> impl Iterator<Item = &StrategyId> {
        self.contributing_strategies.iter().map(|c| &c.strategy_id)
    }
}
