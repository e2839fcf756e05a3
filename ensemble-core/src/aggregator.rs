//! Ensemble Decision Aggregator: weighted vote over current signals.
//!
//! Pure: no I/O, no clock. Same signals, snapshot, and timestamp always give
//! the same decision, which is what makes TEST replays and audits possible.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::EnsembleConfig;
use crate::domain::{
    Action, ActionScores, Contribution, EnsembleDecision, RankingSnapshot, Signal, StrategyId,
    Symbol, Timestamp,
};

#[derive(Debug, Clone)]
pub struct EnsembleAggregator {
    tie_epsilon: f64,
}

impl Default for EnsembleAggregator {
    fn default() -> Self {
        Self::new(&EnsembleConfig::default())
    }
}

impl EnsembleAggregator {
    pub fn new(config: &EnsembleConfig) -> Self {
        Self {
            tie_epsilon: config.tie_epsilon,
        }
    }

    /// Combine `signals` for `instrument` under `snapshot`'s weights.
    ///
    /// Signals for other instruments, malformed signals, and repeat votes from
    /// a strategy that already voted are ignored. Strategies the snapshot
    /// does not know weigh zero. A winner within `tie_epsilon` of the
    /// runner-up, or no weighted vote at all, resolves to HOLD.
    pub fn decide(
        &self,
        instrument: &str,
        signals: &[Signal],
        snapshot: &RankingSnapshot,
        timestamp: Timestamp,
    ) -> EnsembleDecision {
        let mut seen: BTreeSet<&StrategyId> = BTreeSet::new();
        let mut scores = ActionScores::default();
        let mut votes: Vec<(Action, Contribution)> = Vec::new();

        for signal in signals {
            if signal.instrument != instrument || !signal.is_well_formed() {
                continue;
            }
            if !seen.insert(&signal.strategy_id) {
                continue;
            }
            let weight = snapshot.weight(&signal.strategy_id);
            scores.add(signal.action, weight * signal.confidence);
            if weight > 0.0 {
                votes.push((
                    signal.action,
                    Contribution {
                        strategy_id: signal.strategy_id.clone(),
                        weight,
                        confidence: signal.confidence,
                    },
                ));
            }
        }

        let action = self.winner(&scores);
        let aggregate_score = scores.get(action);
        let total = scores.total();
        let sizing_hint = if action.is_hold() || total <= 0.0 {
            0.0
        } else {
            aggregate_score / total
        };
        let mut contributing_strategies: Vec<Contribution> = votes
            .into_iter()
            .filter(|(a, _)| *a == action)
            .map(|(_, c)| c)
            .collect();
        contributing_strategies.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

        debug!(
            instrument,
            %action,
            buy = scores.buy,
            sell = scores.sell,
            hold = scores.hold,
            version = %snapshot.version,
            "ensemble decision"
        );

        EnsembleDecision {
            instrument: Symbol::from(instrument),
            timestamp,
            action,
            aggregate_score,
            scores,
            contributing_strategies,
            sizing_hint,
            snapshot_version: Some(snapshot.version),
        }
    }

    /// `decide` when a snapshot exists, otherwise a fail-closed HOLD.
    pub fn decide_or_hold(
        &self,
        instrument: &str,
        signals: &[Signal],
        snapshot: Option<&RankingSnapshot>,
        timestamp: Timestamp,
    ) -> EnsembleDecision {
        match snapshot {
            Some(s) => self.decide(instrument, signals, s, timestamp),
            None => EnsembleDecision::fail_closed(instrument, timestamp),
        }
    }

    fn winner(&self, scores: &ActionScores) -> Action {
        let mut ranked = [
            (Action::Buy, scores.buy),
            (Action::Sell, scores.sell),
            (Action::Hold, scores.hold),
        ];
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (top, top_score) = ranked[0];
        let runner_up = ranked[1].1;
        if top_score <= self.tie_epsilon || top_score - runner_up <= self.tie_epsilon {
            Action::Hold
        } else {
            top
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SnapshotCandidate, SnapshotVersion, WeightTransform};
    use chrono::{TimeZone, Utc};

    fn ts() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 7, 1, 15, 0, 0).unwrap()
    }

    fn snapshot(weights: &[(&str, f64)]) -> RankingSnapshot {
        let candidate = SnapshotCandidate {
            weights: weights.iter().map(|(id, w)| ((*id).into(), *w)).collect(),
            ranking_order: weights.iter().map(|(id, _)| (*id).into()).collect(),
            scores: weights.iter().map(|(id, _)| ((*id).into(), 0.0)).collect(),
            transform: WeightTransform::default(),
        };
        RankingSnapshot::from_candidate(candidate, SnapshotVersion(4), ts())
    }

    fn sig(id: &str, instrument: &str, action: Action, confidence: f64) -> Signal {
        Signal::new(id.into(), instrument, ts(), action, confidence).unwrap()
    }

    #[test]
    fn weighted_majority_wins() {
        let snap = snapshot(&[("a", 1.0 / 3.0), ("b", 1.0 / 3.0), ("c", 1.0 / 3.0)]);
        let signals = vec![
            sig("a", "X", Action::Buy, 0.6),
            sig("b", "X", Action::Sell, 0.9),
            sig("c", "X", Action::Buy, 0.4),
        ];
        let d = EnsembleAggregator::default().decide("X", &signals, &snap, ts());
        assert_eq!(d.action, Action::Buy);
        let ids: Vec<&str> = d.contributors().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!((d.aggregate_score - 1.0 / 3.0).abs() < 1e-12);
        assert!((d.sizing_hint - 1.0 / 1.9).abs() < 1e-12);
        assert_eq!(d.snapshot_version, Some(SnapshotVersion(4)));
    }

    #[test]
    fn exact_tie_resolves_to_hold() {
        let snap = snapshot(&[("a", 0.5), ("b", 0.5)]);
        let signals = vec![sig("a", "X", Action::Buy, 0.7), sig("b", "X", Action::Sell, 0.7)];
        let d = EnsembleAggregator::default().decide("X", &signals, &snap, ts());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.sizing_hint, 0.0);
        assert!(d.contributing_strategies.is_empty());
    }

    #[test]
    fn near_tie_within_epsilon_holds() {
        let aggregator = EnsembleAggregator::new(&EnsembleConfig { tie_epsilon: 0.05 });
        let snap = snapshot(&[("a", 0.5), ("b", 0.5)]);
        let signals = vec![sig("a", "X", Action::Buy, 0.72), sig("b", "X", Action::Sell, 0.7)];
        assert_eq!(aggregator.decide("X", &signals, &snap, ts()).action, Action::Hold);
    }

    #[test]
    fn all_hold_votes_hold() {
        let snap = snapshot(&[("a", 0.9), ("b", 0.1)]);
        let signals = vec![sig("a", "X", Action::Hold, 1.0), sig("b", "X", Action::Hold, 0.2)];
        let d = EnsembleAggregator::default().decide("X", &signals, &snap, ts());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.contributing_strategies.len(), 2);
    }

    #[test]
    fn no_signals_holds() {
        let snap = snapshot(&[("a", 1.0)]);
        let d = EnsembleAggregator::default().decide("X", &[], &snap, ts());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.aggregate_score, 0.0);
    }

    #[test]
    fn unranked_strategy_has_no_influence() {
        let snap = snapshot(&[("a", 1.0)]);
        let signals = vec![sig("a", "X", Action::Buy, 0.1), sig("newbie", "X", Action::Sell, 1.0)];
        let d = EnsembleAggregator::default().decide("X", &signals, &snap, ts());
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.scores.sell, 0.0);
    }

    #[test]
    fn ignores_foreign_malformed_and_duplicate_signals() {
        let snap = snapshot(&[("a", 0.5), ("b", 0.5)]);
        let mut malformed = sig("b", "X", Action::Sell, 0.5);
        malformed.confidence = 1.5;
        let signals = vec![
            sig("a", "X", Action::Buy, 0.5),
            sig("a", "X", Action::Sell, 1.0),
            sig("b", "Y", Action::Sell, 1.0),
            malformed,
        ];
        let d = EnsembleAggregator::default().decide("X", &signals, &snap, ts());
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.scores.sell, 0.0);
    }

    #[test]
    fn missing_snapshot_fails_closed() {
        let signals = vec![sig("a", "X", Action::Buy, 1.0)];
        let d = EnsembleAggregator::default().decide_or_hold("X", &signals, None, ts());
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.snapshot_version, None);
    }
}
