//! Signal collection: asking every enabled strategy for its vote.
//!
//! Two collectors share one contract:
//! - `InlineCollector` calls sources directly, in id order. Used by TRAIN and
//!   TEST replays, where determinism matters more than latency.
//! - `ThreadedCollector` runs each strategy as a blocking task on a tokio
//!   runtime and waits at most `tick_timeout` per tick. Late, failing, or
//!   malformed strategies abstain for that tick; the rest are aggregated
//!   without them.
//!
//! A strategy is never asked for tick N+1 while its tick N work is still
//! running: a task that missed its deadline is skipped until it finishes,
//! and its stale result is discarded. A strategy that panics is retired.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ensemble_core::domain::{Signal, StrategyId, Symbol};
use ensemble_core::source::{MarketContext, SignalSource, SourceError};

/// Why a strategy contributed nothing for an instrument this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AbstainReason {
    Timeout,
    /// Still working on an earlier tick.
    Busy,
    Failed(String),
    Malformed(String),
    /// The source panicked and was retired.
    Disconnected,
}

impl fmt::Display for AbstainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstainReason::Timeout => write!(f, "timed out"),
            AbstainReason::Busy => write!(f, "busy with an earlier tick"),
            AbstainReason::Failed(e) => write!(f, "failed: {e}"),
            AbstainReason::Malformed(e) => write!(f, "malformed signal: {e}"),
            AbstainReason::Disconnected => write!(f, "retired after a panic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Abstention {
    pub strategy_id: StrategyId,
    /// `None` when the whole strategy abstained for every instrument.
    pub instrument: Option<Symbol>,
    pub reason: AbstainReason,
}

/// Everything collected for one tick.
#[derive(Debug, Clone, Default)]
pub struct CollectedSignals {
    pub signals: Vec<Signal>,
    pub abstained: Vec<Abstention>,
}

impl CollectedSignals {
    pub fn for_instrument<'a>(&'a self, instrument: &'a str) -> impl Iterator<Item = &'a Signal> + 'a {
        self.signals.iter().filter(move |s| s.instrument == instrument)
    }
}

pub trait SignalCollector {
    fn collect(&mut self, tick: u64, contexts: &Arc<Vec<MarketContext>>) -> CollectedSignals;
}

/// Check a returned signal against who produced it and what it was asked.
fn vet(id: &StrategyId, ctx: &MarketContext, result: Result<Signal, SourceError>) -> Result<Signal, AbstainReason> {
    let signal = result.map_err(|e| AbstainReason::Failed(e.to_string()))?;
    if &signal.strategy_id != id {
        return Err(AbstainReason::Malformed(format!(
            "signed as '{}'",
            signal.strategy_id
        )));
    }
    if signal.instrument != ctx.instrument {
        return Err(AbstainReason::Malformed(format!(
            "answered for '{}' instead of '{}'",
            signal.instrument, ctx.instrument
        )));
    }
    if !signal.is_well_formed() {
        return Err(AbstainReason::Malformed(format!(
            "confidence {} outside [0, 1]",
            signal.confidence
        )));
    }
    Ok(signal)
}

fn run_source(source: &dyn SignalSource, contexts: &[MarketContext]) -> Vec<Result<Signal, AbstainReason>> {
    contexts
        .iter()
        .map(|ctx| vet(source.id(), ctx, source.produce_signal(&ctx.instrument, ctx)))
        .collect()
}

fn sort_into(
    collected: &mut CollectedSignals,
    id: &StrategyId,
    contexts: &[MarketContext],
    results: Vec<Result<Signal, AbstainReason>>,
) {
    for (ctx, result) in contexts.iter().zip(results) {
        match result {
            Ok(signal) => collected.signals.push(signal),
            Err(reason) => {
                debug!(strategy = %id, instrument = %ctx.instrument, %reason, "strategy abstained");
                collected.abstained.push(Abstention {
                    strategy_id: id.clone(),
                    instrument: Some(ctx.instrument.clone()),
                    reason,
                });
            }
        }
    }
}

// ─── Inline ──────────────────────────────────────────────────────────

pub struct InlineCollector {
    sources: Vec<Arc<dyn SignalSource>>,
}

impl InlineCollector {
    pub fn new(sources: Vec<Arc<dyn SignalSource>>) -> Self {
        Self { sources }
    }
}

impl SignalCollector for InlineCollector {
    fn collect(&mut self, _tick: u64, contexts: &Arc<Vec<MarketContext>>) -> CollectedSignals {
        let mut collected = CollectedSignals::default();
        for source in &self.sources {
            let results = run_source(source.as_ref(), contexts);
            sort_into(&mut collected, source.id(), contexts, results);
        }
        collected
    }
}

// ─── Threaded ────────────────────────────────────────────────────────

type SourceResults = Vec<Result<Signal, AbstainReason>>;

struct Worker {
    source: Arc<dyn SignalSource>,
    /// Task for a tick that missed its deadline and is still running.
    in_flight: Option<(u64, JoinHandle<SourceResults>)>,
    retired: bool,
}

pub struct ThreadedCollector {
    runtime: Option<Runtime>,
    workers: BTreeMap<StrategyId, Worker>,
    timeout: Duration,
}

impl ThreadedCollector {
    /// Start the runtime that runs sources on its blocking pool.
    pub fn spawn(sources: Vec<Arc<dyn SignalSource>>, timeout: Duration) -> io::Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .thread_name("strategy-worker")
            .build()?;
        let workers = sources
            .into_iter()
            .map(|source| {
                let worker = Worker {
                    source: Arc::clone(&source),
                    in_flight: None,
                    retired: false,
                };
                (source.id().clone(), worker)
            })
            .collect();
        Ok(Self {
            runtime: Some(runtime),
            workers,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for late tasks to finish, then stop the runtime.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            for worker in self.workers.values_mut() {
                if let Some((_, task)) = worker.in_flight.take() {
                    let _ = runtime.block_on(task);
                }
            }
        }
    }
}

impl Drop for ThreadedCollector {
    fn drop(&mut self) {
        // Never block on a source that does not return.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn abstain_all(collected: &mut CollectedSignals, id: &StrategyId, reason: AbstainReason) {
    collected.abstained.push(Abstention {
        strategy_id: id.clone(),
        instrument: None,
        reason,
    });
}

impl SignalCollector for ThreadedCollector {
    fn collect(&mut self, tick: u64, contexts: &Arc<Vec<MarketContext>>) -> CollectedSignals {
        let mut collected = CollectedSignals::default();
        let Some(runtime) = self.runtime.as_ref() else {
            return collected;
        };

        let mut pending = Vec::new();
        for (id, worker) in self.workers.iter_mut() {
            if worker.retired {
                abstain_all(&mut collected, id, AbstainReason::Disconnected);
                continue;
            }
            if let Some((late_tick, task)) = worker.in_flight.take() {
                if !task.is_finished() {
                    worker.in_flight = Some((late_tick, task));
                    abstain_all(&mut collected, id, AbstainReason::Busy);
                    continue;
                }
                if let Err(e) = runtime.block_on(task) {
                    warn!(strategy = %id, tick = late_tick, error = %e, "strategy panicked; retiring it");
                    worker.retired = true;
                    abstain_all(&mut collected, id, AbstainReason::Disconnected);
                    continue;
                }
                debug!(strategy = %id, tick = late_tick, "discarding late result");
            }
            let source = Arc::clone(&worker.source);
            let contexts = Arc::clone(contexts);
            let task = runtime.spawn_blocking(move || run_source(source.as_ref(), &contexts));
            pending.push((id.clone(), task));
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        for (id, mut task) in pending {
            let waited = runtime.block_on(async { tokio::time::timeout_at(deadline, &mut task).await });
            match waited {
                Ok(Ok(results)) => sort_into(&mut collected, &id, contexts, results),
                Ok(Err(e)) => {
                    warn!(strategy = %id, tick, error = %e, "strategy panicked; retiring it");
                    if let Some(worker) = self.workers.get_mut(&id) {
                        worker.retired = true;
                    }
                    abstain_all(&mut collected, &id, AbstainReason::Disconnected);
                }
                Err(_) => {
                    warn!(strategy = %id, tick, timeout_ms = self.timeout.as_millis() as u64, "strategy missed tick deadline");
                    if let Some(worker) = self.workers.get_mut(&id) {
                        worker.in_flight = Some((tick, task));
                    }
                    abstain_all(&mut collected, &id, AbstainReason::Timeout);
                }
            }
        }
        collected
    }
}
