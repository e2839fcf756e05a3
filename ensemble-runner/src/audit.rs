//! Score audit: replay the outcome log from scratch and compare with the
//! incrementally maintained score board.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use ensemble_core::config::DecayConfig;
use ensemble_core::domain::{OutcomeSample, StrategyId};
use ensemble_core::store::{RankingStore, StoreError};
use ensemble_core::tracker::replay_score;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub strategy_id: StrategyId,
    /// `None` when the strategy appears in the log but not on the board.
    pub stored: Option<f64>,
    pub replayed: f64,
    pub logged_samples: usize,
    pub stored_samples: u64,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub tolerance: f64,
    pub samples: usize,
    pub entries: Vec<AuditEntry>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.matches)
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| !e.matches)
    }
}

/// Compare every strategy's stored score with a from-scratch replay.
/// `tolerance` is relative to the replayed magnitude.
pub fn audit_scores(
    store: &dyn RankingStore,
    decay: &DecayConfig,
    tolerance: f64,
) -> Result<AuditReport, StoreError> {
    let log = store.read_outcomes()?;
    let board = store.read_current_scores()?;

    let mut by_strategy: BTreeMap<&StrategyId, Vec<OutcomeSample>> = BTreeMap::new();
    for sample in &log {
        by_strategy.entry(&sample.strategy_id).or_default().push(sample.clone());
    }
    let ids: BTreeSet<&StrategyId> = board.keys().chain(by_strategy.keys().copied()).collect();

    let entries: Vec<AuditEntry> = ids
        .into_iter()
        .map(|id| {
            let samples = by_strategy.get(id).map(Vec::as_slice).unwrap_or_default();
            let replayed = replay_score(samples, decay);
            let state = board.get(id);
            let stored = state.map(|s| if s.sample_count == 0 { decay.neutral_score } else { s.score });
            let stored_samples = state.map_or(0, |s| s.sample_count);
            let matches = stored.is_some_and(|v| (v - replayed).abs() <= tolerance * (1.0 + replayed.abs()))
                && stored_samples == samples.len() as u64;
            if !matches {
                warn!(strategy = %id, ?stored, replayed, logged = samples.len(), stored_samples, "score audit mismatch");
            }
            AuditEntry {
                strategy_id: id.clone(),
                stored,
                replayed,
                logged_samples: samples.len(),
                stored_samples,
                matches,
            }
        })
        .collect();

    let report = AuditReport {
        tolerance,
        samples: log.len(),
        entries,
    };
    info!(
        samples = report.samples,
        strategies = report.entries.len(),
        clean = report.is_clean(),
        "score audit finished"
    );
    Ok(report)
}
