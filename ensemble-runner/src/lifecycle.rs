//! Lifecycle coordinator: TRAIN, TEST, PUSH, and LIVE.
//!
//! Modes are selected per process invocation, never run as concurrent states
//! of one instance:
//! - **TRAIN** replays history through the sources and the tracker and
//!   finalizes one snapshot per evaluation window. Never promotes.
//! - **TEST** replays a held-out period against a finalized snapshot,
//!   read-only with respect to ranking state, and records an evaluation.
//! - **PUSH** re-validates a snapshot, checks its evaluation, and promotes
//!   it. The ranking process's auto-promote passes the same gate; nothing
//!   else moves the current-snapshot pointer.
//! - **LIVE** reads the current snapshot through a `SnapshotSource` and
//!   never computes or finalizes anything itself.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use ensemble_core::config::EngineConfig;
use ensemble_core::domain::{EnsembleDecision, RankingSnapshot, SnapshotVersion, Symbol, Timestamp};
use ensemble_core::evaluation::{EvaluationMetrics, EvaluationRecord};
use ensemble_core::ranking::{FinalizeError, ValidationError};
use ensemble_core::registry::RegistryError;
use ensemble_core::source::MarketContext;
use ensemble_core::store::{RankingStore, SnapshotSource, StoreError};
use ensemble_core::tracker::{ScoreBoard, TrackerError};
use ensemble_core::{EnsembleAggregator, ManualClock, RankingEngine, StrategyRegistry, SystemClock};

use crate::collector::{Abstention, InlineCollector, SignalCollector, ThreadedCollector};
use crate::execution::{ExecutionAdapter, ExecutionReport};
use crate::market::{LoadError, MarketData};
use crate::metrics;
use crate::outcomes::{decision_return, HorizonBook};
use crate::ranking_process::{ProcessStats, RankingProcess};

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("snapshot failed validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("tick {tick} is outside the market timeline ({len} bars)")]
    TickOutOfRange { tick: usize, len: usize },
    #[error("tick range {start}..{end} is empty or exceeds the {len} available bars")]
    BadRange { start: usize, end: usize, len: usize },
    #[error("no finalized snapshot exists; run train first")]
    NoSnapshot,
    #[error("snapshot {0} has no TEST evaluation; run test first or push with --force")]
    Untested(SnapshotVersion),
    #[error("snapshot {0} failed its TEST evaluation; push with --force to override")]
    FailedGate(SnapshotVersion),
    #[error("promotion of snapshot {version} failed after {attempts} attempt(s): {source}")]
    PromotionFailed {
        version: SnapshotVersion,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("failed to start strategy workers: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<FinalizeError> for LifecycleError {
    fn from(e: FinalizeError) -> Self {
        match e {
            FinalizeError::Invalid(v) => LifecycleError::Validation(v),
            FinalizeError::Store(s) => LifecycleError::Store(s),
        }
    }
}

// ─── Modes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Train,
    Test,
    Push,
    Live,
}

impl Mode {
    /// Whether this mode may move the current-snapshot pointer.
    pub fn may_promote(self) -> bool {
        self == Mode::Push
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "TRAIN"),
            Mode::Test => write!(f, "TEST"),
            Mode::Push => write!(f, "PUSH"),
            Mode::Live => write!(f, "LIVE"),
        }
    }
}

/// Split `len` ticks into a leading TRAIN range and a held-out TEST range.
pub fn split_ticks(len: usize, train_fraction: f64) -> (Range<usize>, Range<usize>) {
    let cut = ((len as f64) * train_fraction).round() as usize;
    let cut = cut.min(len);
    (0..cut, cut..len)
}

fn check_range(market: &MarketData, ticks: &Range<usize>) -> Result<(), LifecycleError> {
    if ticks.is_empty() || ticks.end > market.len() {
        return Err(LifecycleError::BadRange {
            start: ticks.start,
            end: ticks.end,
            len: market.len(),
        });
    }
    Ok(())
}

fn resolve_version<S: SnapshotSource + ?Sized>(
    store: &S,
    version: Option<SnapshotVersion>,
) -> Result<SnapshotVersion, LifecycleError> {
    match version {
        Some(v) => Ok(v),
        None => store.latest_version()?.ok_or(LifecycleError::NoSnapshot),
    }
}

// ─── Promotion ───────────────────────────────────────────────────────

/// Promote `version`, retrying transient store failures with exponential
/// backoff. Returns the number of attempts made.
pub fn promote_with_retry(
    store: &dyn RankingStore,
    version: SnapshotVersion,
    retries: u32,
    backoff: Duration,
) -> Result<u32, LifecycleError> {
    let mut attempt: u32 = 0;
    loop {
        match store.promote(version) {
            Ok(()) => {
                info!(%version, attempts = attempt + 1, "snapshot promoted");
                return Ok(attempt + 1);
            }
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = backoff.saturating_mul(1u32 << attempt.min(16));
                warn!(
                    %version,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "promotion failed, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                error!(%version, attempts = attempt + 1, error = %e, "promotion aborted; current snapshot unchanged");
                return Err(LifecycleError::PromotionFailed {
                    version,
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}

// ─── TRAIN ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub mode: Mode,
    pub first_tick: usize,
    pub last_tick: usize,
    /// Samples restored from an earlier run's outcome log.
    pub restored: usize,
    pub restore_skipped: usize,
    pub stats: ProcessStats,
    pub latest: Option<SnapshotVersion>,
    pub board: ScoreBoard,
}

/// Replay `ticks` through every enabled source and the tracker, finalizing a
/// snapshot once per evaluation window and once more at the end.
///
/// Resumes from the store's outcome log. Re-realizing a sample the log
/// already holds is a no-op, so replaying an overlapping range never double
/// counts.
pub fn train(
    config: &EngineConfig,
    registry: &StrategyRegistry,
    market: &MarketData,
    ticks: Range<usize>,
    store: Arc<dyn RankingStore>,
) -> Result<TrainReport, LifecycleError> {
    check_range(market, &ticks)?;
    let timeline = market.timeline();
    let log = store.read_outcomes()?;
    let start = timeline[ticks.start];
    let resume_at = log.iter().map(|s| s.signal_timestamp).max().map_or(start, |t| t.max(start));
    let clock = ManualClock::new(resume_at);

    let collector = InlineCollector::new(registry.enabled());
    let mut process = RankingProcess::new(
        config,
        registry,
        Arc::clone(&store),
        Arc::new(clock.clone()),
        Box::new(collector),
    )
    .with_cadence(config.lifecycle.evaluation_window);
    let restore_skipped = process.restore(&log)?;

    info!(
        mode = %Mode::Train,
        from = ticks.start,
        to = ticks.end,
        strategies = registry.len(),
        enabled = registry.enabled_ids().len(),
        "replay started"
    );
    let mut last = start;
    for tick in ticks.clone() {
        last = timeline[tick];
        clock.set(last);
        let outcome = process.on_tick(market, tick)?;
        if let Some(snapshot) = &outcome.snapshot {
            info!(tick, version = %snapshot.version, "evaluation window finalized");
        }
    }
    let board = process.tracker().board().clone();
    let stats = process.finish(last)?;
    let latest = stats.snapshots.last().copied();
    info!(
        mode = %Mode::Train,
        samples = stats.samples_recorded,
        rejected = stats.samples_rejected,
        duplicate = stats.samples_duplicate,
        snapshots = stats.snapshots.len(),
        "replay finished"
    );

    Ok(TrainReport {
        mode: Mode::Train,
        first_tick: ticks.start,
        last_tick: ticks.end - 1,
        restored: log.len() - restore_skipped,
        restore_skipped,
        stats,
        latest,
        board,
    })
}

// ─── TEST ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub mode: Mode,
    pub version: SnapshotVersion,
    pub metrics: EvaluationMetrics,
    pub passed: bool,
    pub abstentions: usize,
    pub decisions: Vec<EnsembleDecision>,
    pub trade_returns: Vec<f64>,
}

/// Replay `ticks` with a fixed, already-finalized snapshot and record how
/// the ensemble would have done. Ranking state is never touched; the only
/// write is the evaluation record.
pub fn test(
    config: &EngineConfig,
    registry: &StrategyRegistry,
    market: &MarketData,
    ticks: Range<usize>,
    store: &dyn RankingStore,
    version: Option<SnapshotVersion>,
) -> Result<TestReport, LifecycleError> {
    check_range(market, &ticks)?;
    let version = resolve_version(store, version)?;
    let snapshot = store.read_snapshot(version)?;
    let aggregator = EnsembleAggregator::new(&config.ensemble);
    let mut collector = InlineCollector::new(registry.enabled());
    let mut book: HorizonBook<EnsembleDecision> = HorizonBook::new(config.lifecycle.holding_horizon);

    info!(mode = %Mode::Test, %version, from = ticks.start, to = ticks.end, "held-out replay started");
    let mut decisions = Vec::new();
    let mut trade_returns = Vec::new();
    let mut abstentions = 0;
    for tick in ticks.clone() {
        for realized in book.realize_due(tick, |sym| market.close(sym, tick)) {
            if let Some(r) = decision_return(&realized) {
                trade_returns.push(r);
            }
        }
        let contexts = Arc::new(market.contexts(tick, config.lifecycle.history_window));
        let collected = collector.collect(tick as u64, &contexts);
        abstentions += collected.abstained.len();
        for ctx in contexts.iter() {
            let signals: Vec<_> = collected.for_instrument(&ctx.instrument).cloned().collect();
            let decision = aggregator.decide(&ctx.instrument, &signals, &snapshot, ctx.timestamp);
            if decision.is_actionable() {
                if let Some(price) = market.close(&ctx.instrument, tick) {
                    book.queue(decision.clone(), ctx.instrument.clone(), price, tick);
                }
            }
            decisions.push(decision);
        }
    }

    let metrics = metrics::compute(decisions.len(), &trade_returns);
    let evaluated_at = market.timeline()[ticks.end - 1];
    let record = EvaluationRecord::new(version, evaluated_at, metrics.clone(), &config.lifecycle.test_gate);
    store.record_evaluation(&record)?;
    info!(
        mode = %Mode::Test,
        %version,
        trades = metrics.trades,
        hit_rate = metrics.hit_rate,
        total_return = metrics.total_return,
        passed = record.passed,
        unrealized = book.len(),
        "evaluation recorded"
    );

    Ok(TestReport {
        mode: Mode::Test,
        version,
        metrics,
        passed: record.passed,
        abstentions,
        decisions,
        trade_returns,
    })
}

// ─── PUSH ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Latest finalized version when `None`.
    pub version: Option<SnapshotVersion>,
    /// Skip the TEST gate. Validation still applies.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushReport {
    pub mode: Mode,
    pub version: SnapshotVersion,
    pub previous: Option<SnapshotVersion>,
    pub attempts: u32,
    pub forced: bool,
}

/// Publish a finalized snapshot as the one LIVE reads.
///
/// The snapshot is re-read (integrity-checked), re-validated against the
/// currently registered strategy set, and gated on its TEST evaluation
/// before the atomic swap. Any failure leaves the current pointer as it was.
pub fn push(
    config: &EngineConfig,
    registry: &StrategyRegistry,
    store: &dyn RankingStore,
    opts: PushOptions,
) -> Result<PushReport, LifecycleError> {
    let version = resolve_version(store, opts.version)?;
    let engine = RankingEngine::new(config.ranking.clone(), registry.ids(), Arc::new(SystemClock));
    gate_promotion(&engine, store, version, config.lifecycle.require_tested, opts.force)?;

    let previous = store.current_version()?;
    let attempts = promote_with_retry(
        store,
        version,
        config.lifecycle.promote_retries,
        Duration::from_millis(config.lifecycle.promote_backoff_ms),
    )?;
    Ok(PushReport {
        mode: Mode::Push,
        version,
        previous,
        attempts,
        forced: opts.force,
    })
}

/// The checks every promotion passes: the stored snapshot reads back intact,
/// still validates against `engine`'s strategy set, and carries a passing
/// TEST verdict when `require_tested` is set and `force` is not.
pub(crate) fn gate_promotion(
    engine: &RankingEngine,
    store: &dyn RankingStore,
    version: SnapshotVersion,
    require_tested: bool,
    force: bool,
) -> Result<(), LifecycleError> {
    let snapshot = store.read_snapshot(version)?;
    if let Err(e) = engine.validate(&snapshot.to_candidate()) {
        error!(%version, error = %e, "refusing to promote invalid snapshot");
        return Err(e.into());
    }

    if require_tested && !force {
        match store.read_evaluation(version)? {
            None => return Err(LifecycleError::Untested(version)),
            Some(record) if !record.passed => return Err(LifecycleError::FailedGate(version)),
            Some(_) => {}
        }
    } else if force {
        warn!(%version, "promoting without TEST gate");
    }
    Ok(())
}

// ─── LIVE ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub instrument: Symbol,
    pub error: String,
}

/// Everything one LIVE tick produced.
#[derive(Debug, Clone, Default)]
pub struct LiveTick {
    pub tick: u64,
    pub snapshot_version: Option<SnapshotVersion>,
    pub decisions: Vec<EnsembleDecision>,
    pub executions: Vec<ExecutionReport>,
    pub failures: Vec<ExecutionFailure>,
    pub abstained: Vec<Abstention>,
}

impl LiveTick {
    pub fn failed_closed(&self) -> bool {
        self.snapshot_version.is_none()
    }
}

/// LIVE trading loop body. Holds only a read-only snapshot handle.
pub struct LiveTrader<A: ExecutionAdapter> {
    snapshots: Arc<dyn SnapshotSource>,
    collector: Box<dyn SignalCollector>,
    aggregator: EnsembleAggregator,
    adapter: A,
    current: Option<RankingSnapshot>,
    ticks: u64,
}

impl<A: ExecutionAdapter> LiveTrader<A> {
    pub fn new(
        config: &EngineConfig,
        snapshots: Arc<dyn SnapshotSource>,
        collector: Box<dyn SignalCollector>,
        adapter: A,
    ) -> Self {
        Self {
            snapshots,
            collector,
            aggregator: EnsembleAggregator::new(&config.ensemble),
            adapter,
            current: None,
            ticks: 0,
        }
    }

    /// One blocking task per enabled strategy and tick, bounded by the per-tick
    /// timeout.
    pub fn spawn(
        config: &EngineConfig,
        registry: &StrategyRegistry,
        snapshots: Arc<dyn SnapshotSource>,
        adapter: A,
    ) -> Result<Self, LifecycleError> {
        let timeout = Duration::from_millis(config.lifecycle.tick_timeout_ms);
        let collector = ThreadedCollector::spawn(registry.enabled(), timeout).map_err(LifecycleError::Spawn)?;
        Ok(Self::new(config, snapshots, Box::new(collector), adapter))
    }

    pub fn snapshot(&self) -> Option<&RankingSnapshot> {
        self.current.as_ref()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Pick up a newly promoted snapshot. Read failures keep the last
    /// snapshot seen; with none seen yet the tick fails closed.
    fn refresh(&mut self) {
        match self.snapshots.read_current_snapshot() {
            Ok(Some(snapshot)) => {
                let previous = self.current.as_ref().map(|s| s.version);
                if previous != Some(snapshot.version) {
                    info!(version = %snapshot.version, ?previous, "live picked up snapshot");
                }
                self.current = Some(snapshot);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    keeping = ?self.current.as_ref().map(|s| s.version),
                    "snapshot read failed"
                );
            }
        }
    }

    pub fn tick(&mut self, contexts: Vec<MarketContext>, at: Timestamp) -> LiveTick {
        let tick = self.ticks;
        self.ticks += 1;
        self.refresh();

        let mut out = LiveTick {
            tick,
            snapshot_version: self.current.as_ref().map(|s| s.version),
            ..LiveTick::default()
        };
        let Some(snapshot) = self.current.as_ref() else {
            warn!(tick, instruments = contexts.len(), "no promoted snapshot; holding everything");
            out.decisions = contexts
                .iter()
                .map(|ctx| self.aggregator.decide_or_hold(&ctx.instrument, &[], None, at))
                .collect();
            return out;
        };

        let contexts = Arc::new(contexts);
        let collected = self.collector.collect(tick, &contexts);
        for abstention in &collected.abstained {
            warn!(tick, strategy = %abstention.strategy_id, reason = %abstention.reason, "strategy abstained");
        }
        for ctx in contexts.iter() {
            let signals: Vec<_> = collected.for_instrument(&ctx.instrument).cloned().collect();
            let decision = self.aggregator.decide(&ctx.instrument, &signals, snapshot, at);
            if decision.is_actionable() {
                match ctx.last().map(|b| b.close) {
                    Some(price) => match self.adapter.submit(&decision, price) {
                        Ok(report) => out.executions.push(report),
                        Err(e) => {
                            warn!(instrument = %ctx.instrument, action = %decision.action, error = %e, "execution failed");
                            out.failures.push(ExecutionFailure {
                                instrument: ctx.instrument.clone(),
                                error: e.to_string(),
                            });
                        }
                    },
                    None => out.failures.push(ExecutionFailure {
                        instrument: ctx.instrument.clone(),
                        error: "no price in market context".into(),
                    }),
                }
            }
            out.decisions.push(decision);
        }
        out.abstained = collected.abstained;
        out
    }
}
