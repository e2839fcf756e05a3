//! Ranking process: the writer side of the engine.
//!
//! Each tick realizes outcomes that came due, feeds them to the tracker and
//! the outcome log, collects fresh signals, and queues them for later
//! realization. Every `cadence` ticks it recomputes, validates, and finalizes
//! a snapshot. Promotion happens only when an auto-promote policy was given
//! (the continuous PUSH path), and only through PUSH's gate; TRAIN never
//! promotes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use ensemble_core::config::EngineConfig;
use ensemble_core::domain::{OutcomeSample, RankingSnapshot, SnapshotVersion, StrategyId, Symbol, Timestamp};
use ensemble_core::ranking::FinalizeError;
use ensemble_core::store::RankingStore;
use ensemble_core::tracker::TrackerError;
use ensemble_core::{Clock, PerformanceTracker, RankingEngine, StrategyRegistry};

use crate::collector::{Abstention, SignalCollector};
use crate::lifecycle::{gate_promotion, promote_with_retry, LifecycleError};
use crate::market::MarketData;
use crate::outcomes::OutcomeBook;

/// Gate and retry policy for promotions made by the ranking process itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionPolicy {
    pub retries: u32,
    pub backoff: Duration,
    /// Withhold snapshots without a passing TEST verdict.
    pub require_tested: bool,
    /// Promote without the TEST verdict. Validation still applies.
    pub force: bool,
}

impl PromotionPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retries: config.lifecycle.promote_retries,
            backoff: Duration::from_millis(config.lifecycle.promote_backoff_ms),
            require_tested: config.lifecycle.require_tested,
            force: false,
        }
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Running totals over the life of a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub ticks: usize,
    pub signals: usize,
    pub abstentions: usize,
    pub samples_recorded: usize,
    pub samples_rejected: usize,
    /// Realized samples already present in the restored log.
    pub samples_duplicate: usize,
    pub snapshots: Vec<SnapshotVersion>,
    pub rejected_candidates: Vec<String>,
    /// Finalized snapshots auto-promote held back for lack of a passing TEST.
    pub withheld: Vec<SnapshotVersion>,
    pub promoted: Option<SnapshotVersion>,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub realized: usize,
    pub signals: usize,
    pub abstained: Vec<Abstention>,
    pub snapshot: Option<RankingSnapshot>,
}

pub struct RankingProcess {
    tracker: PerformanceTracker,
    engine: RankingEngine,
    book: OutcomeBook,
    collector: Box<dyn SignalCollector>,
    store: Arc<dyn RankingStore>,
    history_window: usize,
    cadence: usize,
    promotion: Option<PromotionPolicy>,
    since_recompute: usize,
    /// Latest logged signal timestamp per (strategy, instrument). Samples for
    /// a pair arrive in signal order, so anything at or before the mark is
    /// already in the log.
    logged: BTreeMap<(StrategyId, Symbol), Timestamp>,
    stats: ProcessStats,
}

fn log_key(sample: &OutcomeSample) -> (StrategyId, Symbol) {
    (sample.strategy_id.clone(), sample.instrument.clone())
}

impl RankingProcess {
    /// Every registered strategy is tracked and ranked, enabled or not; the
    /// collector decides who is actually polled.
    pub fn new(
        config: &EngineConfig,
        registry: &StrategyRegistry,
        store: Arc<dyn RankingStore>,
        clock: Arc<dyn Clock>,
        collector: Box<dyn SignalCollector>,
    ) -> Self {
        let ids = registry.ids();
        let tracker = PerformanceTracker::new(
            config.decay.clone(),
            config.universe.iter().cloned(),
            ids.iter().cloned(),
            Arc::clone(&clock),
        );
        let engine = RankingEngine::new(config.ranking.clone(), ids, clock);
        Self {
            tracker,
            engine,
            book: OutcomeBook::new(config.lifecycle.holding_horizon),
            collector,
            store,
            history_window: config.lifecycle.history_window,
            cadence: config.ranking.recompute_every,
            promotion: None,
            since_recompute: 0,
            logged: BTreeMap::new(),
            stats: ProcessStats::default(),
        }
    }

    pub fn with_cadence(mut self, ticks: usize) -> Self {
        self.cadence = ticks.max(1);
        self
    }

    pub fn with_auto_promote(mut self, policy: PromotionPolicy) -> Self {
        self.promotion = Some(policy);
        self
    }

    /// Replay a persisted outcome log into the tracker. Samples the tracker
    /// no longer accepts (removed strategy or instrument) are skipped and
    /// counted. Re-realizing a logged sample later is a no-op.
    pub fn restore(&mut self, log: &[OutcomeSample]) -> Result<usize, LifecycleError> {
        let mut skipped = 0;
        for sample in log {
            self.mark_logged(sample);
            match self.tracker.record_outcome(sample) {
                Ok(_) => {}
                Err(TrackerError::InvalidSample(e)) => {
                    debug!(error = %e, "skipping logged sample");
                    skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if skipped > 0 {
            warn!(skipped, restored = log.len() - skipped, "outcome log partially restored");
        } else {
            info!(restored = log.len(), "outcome log restored");
        }
        Ok(skipped)
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    pub fn engine(&self) -> &RankingEngine {
        &self.engine
    }

    pub fn stats(&self) -> &ProcessStats {
        &self.stats
    }

    pub fn pending_outcomes(&self) -> usize {
        self.book.len()
    }

    pub fn on_tick(&mut self, market: &MarketData, tick: usize) -> Result<TickOutcome, LifecycleError> {
        let Some(&timestamp) = market.timeline().get(tick) else {
            return Err(LifecycleError::TickOutOfRange {
                tick,
                len: market.len(),
            });
        };

        // Outcomes first: tick N's bookkeeping precedes tick N+1's signals.
        let due = self.book.realize_samples(tick, |sym| market.close(sym, tick));
        let mut outcome = TickOutcome {
            realized: due.len(),
            ..TickOutcome::default()
        };
        for sample in &due {
            self.admit(sample)?;
        }

        let contexts = Arc::new(market.contexts(tick, self.history_window));
        let collected = self.collector.collect(tick as u64, &contexts);
        outcome.signals = collected.signals.len();
        outcome.abstained = collected.abstained;
        for signal in collected.signals {
            if let Some(price) = market.close(&signal.instrument, tick) {
                self.book.queue_signal(signal, price, tick);
            }
        }

        self.stats.ticks += 1;
        self.stats.signals += outcome.signals;
        self.stats.abstentions += outcome.abstained.len();
        self.since_recompute += 1;
        if self.since_recompute >= self.cadence {
            outcome.snapshot = self.recompute(timestamp)?;
        }
        Ok(outcome)
    }

    fn admit(&mut self, sample: &OutcomeSample) -> Result<(), LifecycleError> {
        if self
            .logged
            .get(&log_key(sample))
            .is_some_and(|mark| sample.signal_timestamp <= *mark)
        {
            self.stats.samples_duplicate += 1;
            return Ok(());
        }
        if let Err(e) = self.tracker.check(sample) {
            warn!(strategy = %sample.strategy_id, instrument = %sample.instrument, error = %e, "outcome sample rejected");
            self.stats.samples_rejected += 1;
            return Ok(());
        }
        self.store.append(sample)?;
        self.tracker.record_outcome(sample)?;
        self.mark_logged(sample);
        self.stats.samples_recorded += 1;
        Ok(())
    }

    fn mark_logged(&mut self, sample: &OutcomeSample) {
        let mark = self.logged.entry(log_key(sample)).or_insert(sample.signal_timestamp);
        if sample.signal_timestamp > *mark {
            *mark = sample.signal_timestamp;
        }
    }

    /// Compute, validate, and finalize a snapshot from scores decayed to
    /// `at`. A candidate that fails validation is logged and dropped; the
    /// current snapshot stays in force.
    pub fn recompute(&mut self, at: Timestamp) -> Result<Option<RankingSnapshot>, LifecycleError> {
        self.since_recompute = 0;
        let scores = self.tracker.scores_as_of(at);
        let candidate = self.engine.compute_snapshot(&scores);
        let snapshot = match self.engine.finalize(candidate, self.store.as_ref()) {
            Ok(snapshot) => snapshot,
            Err(FinalizeError::Invalid(e)) => {
                error!(error = %e, "candidate snapshot rejected; current snapshot stays in force");
                self.stats.rejected_candidates.push(e.to_string());
                return Ok(None);
            }
            Err(FinalizeError::Store(e)) => return Err(e.into()),
        };
        self.store.write_scores(self.tracker.board())?;
        self.stats.snapshots.push(snapshot.version);

        if let Some(policy) = self.promotion {
            self.auto_promote(snapshot.version, policy)?;
        }
        Ok(Some(snapshot))
    }

    fn auto_promote(&mut self, version: SnapshotVersion, policy: PromotionPolicy) -> Result<(), LifecycleError> {
        let store = self.store.as_ref();
        match gate_promotion(&self.engine, store, version, policy.require_tested, policy.force) {
            Ok(()) => {}
            Err(e @ (LifecycleError::Untested(_) | LifecycleError::FailedGate(_))) => {
                warn!(%version, error = %e, "snapshot withheld from auto-promote");
                self.stats.withheld.push(version);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        promote_with_retry(store, version, policy.retries, policy.backoff)?;
        self.stats.promoted = Some(version);
        Ok(())
    }

    /// Finalize whatever accumulated since the last recompute and persist
    /// the score board.
    pub fn finish(mut self, at: Timestamp) -> Result<ProcessStats, LifecycleError> {
        if self.since_recompute > 0 || self.stats.snapshots.is_empty() {
            self.recompute(at)?;
        } else {
            self.store.write_scores(self.tracker.board())?;
        }
        Ok(self.stats)
    }
}
