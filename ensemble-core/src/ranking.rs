//! Ranking Engine: scores to ordered, normalized, versioned weights.
//!
//! `compute_snapshot` is pure and deterministic. `validate` guards the
//! invariants a snapshot must hold before anyone may consume it. `finalize`
//! versions and persists a validated candidate; making it current is a
//! separate promotion step owned by the lifecycle coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::RankingConfig;
use crate::domain::{RankingSnapshot, SnapshotCandidate, SnapshotVersion, StrategyId, WeightTransform};
use crate::store::{RankingStore, StoreError};

/// Ranking input for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyScore {
    pub value: f64,
    /// Zero marks a cold-start strategy.
    pub sample_count: u64,
}

impl StrategyScore {
    pub fn new(value: f64, sample_count: u64) -> Self {
        Self { value, sample_count }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("snapshot has no strategies")]
    Empty,
    #[error("weight for '{strategy}' is not finite: {weight}")]
    NonFinite { strategy: StrategyId, weight: f64 },
    #[error("weight for '{strategy}' is negative: {weight}")]
    Negative { strategy: StrategyId, weight: f64 },
    #[error("registered strategy '{0}' is missing from the snapshot")]
    Missing(StrategyId),
    #[error("snapshot contains unregistered strategy '{0}'")]
    Unregistered(StrategyId),
    #[error("weights sum to {sum}, expected 1 within {tolerance}")]
    BadSum { sum: f64, tolerance: f64 },
    #[error("ranking order does not cover the weighted strategies exactly once")]
    OrderMismatch,
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("candidate rejected: {0}")]
    Invalid(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ─── Engine ──────────────────────────────────────────────────────────

pub struct RankingEngine {
    config: RankingConfig,
    registered: BTreeSet<StrategyId>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RankingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankingEngine")
            .field("config", &self.config)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl RankingEngine {
    pub fn new(
        config: RankingConfig,
        registered: impl IntoIterator<Item = StrategyId>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registered: registered.into_iter().collect(),
            clock,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    pub fn registered(&self) -> &BTreeSet<StrategyId> {
        &self.registered
    }

    /// Sort by descending score (ties by ascending id) and derive weights.
    ///
    /// Cold-start strategies get `min(cold_start_weight, 1/n)` each. The
    /// remaining mass is shared by scored strategies: each gets the floor
    /// `min(min_weight, 1/n)` plus a share of the rest proportional to its
    /// transformed score. Non-finite scores are passed through so that
    /// `validate` rejects the result.
    pub fn compute_snapshot(&self, scores: &BTreeMap<StrategyId, StrategyScore>) -> SnapshotCandidate {
        let mut ranking_order: Vec<StrategyId> = scores.keys().cloned().collect();
        ranking_order.sort_by(|a, b| {
            scores[b]
                .value
                .total_cmp(&scores[a].value)
                .then_with(|| a.cmp(b))
        });

        let weights = self.weights(scores);
        SnapshotCandidate {
            weights,
            ranking_order,
            scores: scores.iter().map(|(id, s)| (id.clone(), s.value)).collect(),
            transform: self.config.transform,
        }
    }

    fn weights(&self, scores: &BTreeMap<StrategyId, StrategyScore>) -> BTreeMap<StrategyId, f64> {
        let n = scores.len();
        if n == 0 {
            return BTreeMap::new();
        }
        let uniform = 1.0 / n as f64;
        let (cold, scored): (Vec<_>, Vec<_>) = scores.iter().partition(|(_, s)| s.sample_count == 0);
        if scored.is_empty() {
            return scores.keys().map(|id| (id.clone(), uniform)).collect();
        }

        let cold_weight = self.config.cold_start_weight.min(uniform);
        let floor = self.config.min_weight.min(uniform);
        let mass = 1.0 - cold_weight * cold.len() as f64;
        let spread = mass - floor * scored.len() as f64;

        let values: Vec<f64> = scored.iter().map(|(_, s)| s.value).collect();
        let raw = transform(self.config.transform, &values);
        let total: f64 = raw.iter().sum();

        let mut weights: BTreeMap<StrategyId, f64> =
            cold.iter().map(|(id, _)| ((*id).clone(), cold_weight)).collect();
        for ((id, _), r) in scored.iter().zip(raw) {
            weights.insert((*id).clone(), floor + spread * r / total);
        }
        weights
    }

    /// Check a candidate against the weight invariants and the registered
    /// strategy set. Reports the first violation found.
    pub fn validate(&self, candidate: &SnapshotCandidate) -> Result<(), ValidationError> {
        if candidate.weights.is_empty() {
            return Err(ValidationError::Empty);
        }
        for (id, &w) in &candidate.weights {
            if !w.is_finite() {
                return Err(ValidationError::NonFinite {
                    strategy: id.clone(),
                    weight: w,
                });
            }
            if w < 0.0 {
                return Err(ValidationError::Negative {
                    strategy: id.clone(),
                    weight: w,
                });
            }
        }
        if let Some(id) = self.registered.iter().find(|id| !candidate.weights.contains_key(*id)) {
            return Err(ValidationError::Missing(id.clone()));
        }
        if let Some(id) = candidate.weights.keys().find(|id| !self.registered.contains(*id)) {
            return Err(ValidationError::Unregistered(id.clone()));
        }
        let sum: f64 = candidate.weights.values().sum();
        if (sum - 1.0).abs() > self.config.sum_tolerance {
            return Err(ValidationError::BadSum {
                sum,
                tolerance: self.config.sum_tolerance,
            });
        }
        let ordered: BTreeSet<&StrategyId> = candidate.ranking_order.iter().collect();
        if candidate.ranking_order.len() != candidate.weights.len()
            || ordered.len() != candidate.ranking_order.len()
            || ordered.iter().any(|id| !candidate.weights.contains_key(*id))
        {
            return Err(ValidationError::OrderMismatch);
        }
        Ok(())
    }

    /// Validate, assign the next version, timestamp, and persist.
    ///
    /// Does not promote. Running this twice on the same candidate yields two
    /// versions with the same content hash.
    pub fn finalize(
        &self,
        candidate: SnapshotCandidate,
        store: &dyn RankingStore,
    ) -> Result<RankingSnapshot, FinalizeError> {
        self.validate(&candidate)?;
        let version = store
            .latest_version()?
            .map_or(SnapshotVersion(1), SnapshotVersion::next);
        let snapshot = RankingSnapshot::from_candidate(candidate, version, self.clock.now());
        store.write_candidate_snapshot(&snapshot)?;
        info!(
            version = %snapshot.version,
            strategies = snapshot.weights.len(),
            hash = %snapshot.content_hash,
            "snapshot finalized"
        );
        Ok(snapshot)
    }
}

/// Raw monotonic weights for a set of scores. Always yields a positive sum
/// for finite input.
fn transform(kind: WeightTransform, values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    match kind {
        WeightTransform::Softmax { temperature } => {
            values.iter().map(|v| ((v - max) / temperature).exp()).collect()
        }
        WeightTransform::MinMax => {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let range = max - min;
            if range > 0.0 {
                values.iter().map(|v| (v - min) / range).collect()
            } else {
                // Flat population; NaN input still propagates.
                values.iter().map(|v| if v.is_nan() { f64::NAN } else { 1.0 }).collect()
            }
        }
    }
}
