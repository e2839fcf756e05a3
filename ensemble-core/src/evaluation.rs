//! TEST-mode evaluation results and the promotion gate.

use serde::{Deserialize, Serialize};

use crate::config::TestGate;
use crate::domain::{SnapshotVersion, Timestamp};

/// Ensemble-level simulated performance over a held-out period.
///
/// Returns are per realized trade, direction-adjusted, and compounded for
/// `total_return` and `max_drawdown`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Ensemble decisions made (including HOLD).
    pub decisions: usize,
    /// BUY/SELL decisions whose outcome was realized.
    pub trades: usize,
    pub hits: usize,
    pub hit_rate: f64,
    pub total_return: f64,
    pub mean_return: f64,
    pub return_std: f64,
    /// Per-trade Sharpe (not annualized).
    pub sharpe: f64,
    pub max_drawdown: f64,
}

impl EvaluationMetrics {
    pub fn passes(&self, gate: &TestGate) -> bool {
        self.trades >= gate.min_trades
            && self.hit_rate >= gate.min_hit_rate
            && self.total_return >= gate.min_total_return
    }
}

/// Stored verdict of a TEST run against one snapshot version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub version: SnapshotVersion,
    pub evaluated_at: Timestamp,
    pub metrics: EvaluationMetrics,
    pub passed: bool,
}

impl EvaluationRecord {
    pub fn new(
        version: SnapshotVersion,
        evaluated_at: Timestamp,
        metrics: EvaluationMetrics,
        gate: &TestGate,
    ) -> Self {
        let passed = metrics.passes(gate);
        Self {
            version,
            evaluated_at,
            metrics,
            passed,
        }
    }
}
