//! LIVE and store behavior under failure and concurrency.
//!
//! - LIVE keeps the last snapshot it saw when reads fail, and holds
//!   everything while no snapshot was ever promoted
//! - A slow strategy abstains; the ensemble still decides without it
//! - A failed push leaves the previous snapshot in force
//! - Readers racing a promoter only ever see whole, hash-valid snapshots
//! - A file-backed store survives a full lifecycle and a reopen

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeZone, Utc};

use ensemble_core::config::{EngineConfig, StrategyEntry, TestGate};
use ensemble_core::domain::{
    Action, Bar, RankingSnapshot, Signal, SnapshotCandidate, SnapshotVersion, StrategyId, Timestamp,
    WeightTransform,
};
use ensemble_core::source::{MarketContext, SignalSource, SourceError};
use ensemble_core::store::{FileStore, MemoryStore, RankingStore, SnapshotSource};
use ensemble_core::StrategyRegistry;
use ensemble_runner::collector::AbstainReason;
use ensemble_runner::lifecycle::{self, push, train, LifecycleError, LiveTrader, PushOptions};
use ensemble_runner::market::{generate_synthetic_bars, MarketData};
use ensemble_runner::{audit_scores, InlineCollector, PaperBroker};

fn ts() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 6, 3, 15, 0, 0).unwrap()
}

struct Voter {
    id: StrategyId,
    action: Action,
    delay: Duration,
}

impl SignalSource for Voter {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn kind(&self) -> &str {
        "voter"
    }

    fn warmup_bars(&self) -> usize {
        0
    }

    fn produce_signal(&self, instrument: &str, ctx: &MarketContext) -> Result<Signal, SourceError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Signal::new(self.id.clone(), instrument, ctx.timestamp, self.action, 0.8)
            .map_err(|e| SourceError::Failed(e.to_string()))
    }
}

fn voter(id: &str, action: Action, delay_ms: u64) -> Arc<dyn SignalSource> {
    Arc::new(Voter {
        id: id.into(),
        action,
        delay: Duration::from_millis(delay_ms),
    })
}

fn snapshot(version: u64, weights: &[(&str, f64)]) -> RankingSnapshot {
    let mut order: Vec<StrategyId> = weights.iter().map(|(id, _)| (*id).into()).collect();
    order.sort_by(|a, b| {
        let wa = weights.iter().find(|(id, _)| *id == a.as_str()).map_or(0.0, |(_, w)| *w);
        let wb = weights.iter().find(|(id, _)| *id == b.as_str()).map_or(0.0, |(_, w)| *w);
        wb.total_cmp(&wa).then_with(|| a.cmp(b))
    });
    let candidate = SnapshotCandidate {
        weights: weights.iter().map(|(id, w)| ((*id).into(), *w)).collect(),
        ranking_order: order,
        scores: weights.iter().map(|(id, w)| ((*id).into(), *w)).collect(),
        transform: WeightTransform::default(),
    };
    RankingSnapshot::from_candidate(candidate, SnapshotVersion(version), ts())
}

fn context(symbol: &str, close: f64) -> MarketContext {
    let bar = Bar {
        symbol: symbol.into(),
        timestamp: ts(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000,
    };
    MarketContext::new(symbol, ts(), vec![bar])
}

fn two_voter_registry(slow_ms: u64) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(voter("fast", Action::Buy, 0), true).unwrap();
    registry.register(voter("slow", Action::Sell, slow_ms), true).unwrap();
    registry
}

// ── LIVE snapshot handling ───────────────────────────────────────────

#[test]
fn live_holds_everything_until_a_snapshot_is_promoted() {
    let config = EngineConfig::default();
    let registry = two_voter_registry(0);
    let store = Arc::new(MemoryStore::new());
    let reader: Arc<dyn SnapshotSource> = store.clone();
    let collector = InlineCollector::new(registry.enabled());
    let mut trader = LiveTrader::new(&config, reader, Box::new(collector), PaperBroker::new(50_000.0));

    let out = trader.tick(vec![context("X", 100.0), context("Y", 50.0)], ts());
    assert!(out.failed_closed());
    assert_eq!(out.decisions.len(), 2);
    assert!(out.decisions.iter().all(|d| d.action == Action::Hold));
    assert!(out.executions.is_empty());

    store.write_candidate_snapshot(&snapshot(1, &[("fast", 0.75), ("slow", 0.25)])).unwrap();
    store.promote(SnapshotVersion(1)).unwrap();

    let out = trader.tick(vec![context("X", 100.0)], ts());
    assert_eq!(out.snapshot_version, Some(SnapshotVersion(1)));
    assert_eq!(out.decisions[0].action, Action::Buy);
    assert_eq!(out.executions.len(), 1);
}

#[test]
fn live_keeps_last_snapshot_when_reads_fail() {
    let config = EngineConfig::default();
    let registry = two_voter_registry(0);
    let store = Arc::new(MemoryStore::new());
    store.write_candidate_snapshot(&snapshot(1, &[("fast", 0.75), ("slow", 0.25)])).unwrap();
    store.promote(SnapshotVersion(1)).unwrap();

    let reader: Arc<dyn SnapshotSource> = store.clone();
    let collector = InlineCollector::new(registry.enabled());
    let mut trader = LiveTrader::new(&config, reader, Box::new(collector), PaperBroker::new(50_000.0));
    assert_eq!(trader.tick(vec![context("X", 100.0)], ts()).snapshot_version, Some(SnapshotVersion(1)));

    store.fail_next_reads(3);
    for _ in 0..3 {
        let out = trader.tick(vec![context("X", 100.0)], ts());
        assert_eq!(out.snapshot_version, Some(SnapshotVersion(1)));
        assert_eq!(out.decisions[0].snapshot_version, Some(SnapshotVersion(1)));
        assert!(!out.failed_closed());
    }

    // A newer promotion is picked up once reads recover.
    store.write_candidate_snapshot(&snapshot(2, &[("fast", 0.25), ("slow", 0.75)])).unwrap();
    store.promote(SnapshotVersion(2)).unwrap();
    let out = trader.tick(vec![context("X", 100.0)], ts());
    assert_eq!(out.snapshot_version, Some(SnapshotVersion(2)));
    assert_eq!(out.decisions[0].action, Action::Sell);
}

#[test]
fn live_fails_closed_when_first_read_fails() {
    let config = EngineConfig::default();
    let registry = two_voter_registry(0);
    let store = Arc::new(MemoryStore::new());
    store.write_candidate_snapshot(&snapshot(1, &[("fast", 0.5), ("slow", 0.5)])).unwrap();
    store.promote(SnapshotVersion(1)).unwrap();
    store.fail_next_reads(1);

    let reader: Arc<dyn SnapshotSource> = store.clone();
    let collector = InlineCollector::new(registry.enabled());
    let mut trader = LiveTrader::new(&config, reader, Box::new(collector), PaperBroker::new(50_000.0));
    let out = trader.tick(vec![context("X", 100.0)], ts());
    assert!(out.failed_closed());
    assert_eq!(out.decisions[0].action, Action::Hold);
    assert!(trader.adapter().holdings().is_empty());
}

// ── Strategy timeouts ────────────────────────────────────────────────

#[test]
fn slow_strategy_abstains_and_the_rest_still_decide() {
    let mut config = EngineConfig::default();
    config.lifecycle.tick_timeout_ms = 50;
    let registry = two_voter_registry(400);
    let store = Arc::new(MemoryStore::new());
    store.write_candidate_snapshot(&snapshot(1, &[("fast", 0.4), ("slow", 0.6)])).unwrap();
    store.promote(SnapshotVersion(1)).unwrap();

    let reader: Arc<dyn SnapshotSource> = store.clone();
    let mut trader = LiveTrader::spawn(&config, &registry, reader, PaperBroker::new(50_000.0)).unwrap();

    let out = trader.tick(vec![context("X", 100.0)], ts());
    // The heavier SELL voter missed the deadline, so the BUY stands.
    assert_eq!(out.decisions[0].action, Action::Buy);
    let ids: Vec<&str> = out.decisions[0].contributors().map(|id| id.as_str()).collect();
    assert_eq!(ids, vec!["fast"]);
    assert_eq!(out.abstained.len(), 1);
    assert_eq!(out.abstained[0].strategy_id.as_str(), "slow");
    assert_eq!(out.abstained[0].reason, AbstainReason::Timeout);

    // Still working on the previous tick: skipped, not queued twice.
    let out = trader.tick(vec![context("X", 100.0)], ts());
    assert_eq!(out.abstained.len(), 1);
    assert_eq!(out.abstained[0].reason, AbstainReason::Busy);
    assert_eq!(out.decisions[0].action, Action::Buy);
}

// ── PUSH failure ─────────────────────────────────────────────────────

#[test]
fn failed_push_keeps_previous_snapshot_live() {
    let mut config = EngineConfig::default();
    config.lifecycle.promote_retries = 2;
    config.lifecycle.promote_backoff_ms = 1;
    let registry = two_voter_registry(0);
    let store = Arc::new(MemoryStore::new());
    store.write_candidate_snapshot(&snapshot(1, &[("fast", 0.75), ("slow", 0.25)])).unwrap();
    store.write_candidate_snapshot(&snapshot(2, &[("fast", 0.25), ("slow", 0.75)])).unwrap();
    store.promote(SnapshotVersion(1)).unwrap();

    store.fail_next_promotions(10);
    let opts = PushOptions {
        version: Some(SnapshotVersion(2)),
        force: true,
    };
    let err = push(&config, &registry, store.as_ref(), opts).unwrap_err();
    assert!(matches!(err, LifecycleError::PromotionFailed { attempts: 3, .. }));
    assert_eq!(store.current_version().unwrap(), Some(SnapshotVersion(1)));

    let reader: Arc<dyn SnapshotSource> = store.clone();
    let collector = InlineCollector::new(registry.enabled());
    let mut trader = LiveTrader::new(&config, reader, Box::new(collector), PaperBroker::new(50_000.0));
    let out = trader.tick(vec![context("X", 100.0)], ts());
    assert_eq!(out.snapshot_version, Some(SnapshotVersion(1)));
    assert_eq!(out.decisions[0].action, Action::Buy);
}

// ── Concurrent readers vs promoter ───────────────────────────────────

/// Raises the flag when dropped, including while unwinding.
struct RaiseOnDrop<'a>(&'a AtomicBool);

impl Drop for RaiseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn race_readers_against_promoter(store: Arc<dyn RankingStore>) {
    const VERSIONS: u64 = 20;
    let first = snapshot(1, &[("a", 0.5), ("b", 0.5)]);
    store.write_candidate_snapshot(&first).unwrap();
    store.promote(first.version).unwrap();
    let writer_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writer = Arc::clone(&store);
        let done = &writer_done;
        scope.spawn(move || {
            let _raise = RaiseOnDrop(done);
            for v in 2..=VERSIONS {
                let a = v as f64 / (VERSIONS as f64 + 1.0);
                let next = snapshot(v, &[("a", a), ("b", 1.0 - a), ("c", 0.0)]);
                writer.write_candidate_snapshot(&next).unwrap();
                writer.promote(next.version).unwrap();
            }
        });

        for _ in 0..4 {
            let reader = Arc::clone(&store);
            let done = &writer_done;
            scope.spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(30);
                let mut last = SnapshotVersion(0);
                loop {
                    // Read the flag first so the last pass sees the final promotion.
                    let finished = done.load(Ordering::Acquire);
                    let current = reader.read_current_snapshot().unwrap().unwrap();
                    assert!(current.verify_hash(), "torn snapshot {}", current.version);
                    let sum: f64 = current.weights.values().sum();
                    assert!((sum - 1.0).abs() < 1e-9, "weights of {} sum to {sum}", current.version);
                    assert!(current.version >= last, "went back from {last} to {}", current.version);
                    last = current.version;
                    if finished || Instant::now() > deadline {
                        break;
                    }
                }
                assert_eq!(last, SnapshotVersion(VERSIONS), "writer stopped before the last promotion");
            });
        }
    });
}

#[test]
fn memory_store_readers_never_see_partial_promotions() {
    race_readers_against_promoter(Arc::new(MemoryStore::new()));
}

#[test]
fn file_store_readers_never_see_partial_promotions() {
    let dir = tempfile::tempdir().unwrap();
    race_readers_against_promoter(Arc::new(FileStore::open(dir.path()).unwrap()));
}

// ── File-backed lifecycle ────────────────────────────────────────────

fn config() -> EngineConfig {
    let mut config = EngineConfig {
        universe: vec!["AAA".into(), "BBB".into()],
        strategies: vec![
            StrategyEntry::new("mom", "momentum", &[("lookback", 10.0), ("threshold", 0.01)]),
            StrategyEntry::new("cross", "ma_crossover", &[("fast", 5.0), ("slow", 15.0)]),
            StrategyEntry::new("brk", "breakout", &[("lookback", 20.0)]),
        ],
        ..EngineConfig::default()
    };
    config.lifecycle.evaluation_window = 30;
    config.lifecycle.holding_horizon = 2;
    config.lifecycle.history_window = 30;
    config.lifecycle.test_gate = TestGate {
        min_trades: 0,
        min_hit_rate: 0.0,
        min_total_return: -1.0,
    };
    config
}

fn market() -> MarketData {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let series: BTreeMap<_, _> = ["AAA", "BBB"]
        .iter()
        .map(|s| (s.to_string(), generate_synthetic_bars(s, start, 160)))
        .collect();
    MarketData::align(series).unwrap()
}

#[test]
fn file_store_lifecycle_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let registry = StrategyRegistry::from_config(&config.strategies).unwrap();
    let market = market();

    let (trained, pushed) = {
        let store: Arc<dyn RankingStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let trained = train(&config, &registry, &market, 0..110, Arc::clone(&store)).unwrap();
        let tested = lifecycle::test(&config, &registry, &market, 110..160, store.as_ref(), None).unwrap();
        assert!(tested.passed);
        let pushed = push(&config, &registry, store.as_ref(), PushOptions::default()).unwrap();
        (trained, pushed)
    };

    let reopened = FileStore::open(dir.path()).unwrap();
    assert_eq!(reopened.current_version().unwrap(), Some(pushed.version));
    assert_eq!(reopened.list_versions().unwrap(), trained.stats.snapshots);
    assert_eq!(reopened.read_outcomes().unwrap().len(), trained.stats.samples_recorded);
    assert!(reopened.read_evaluation(pushed.version).unwrap().unwrap().passed);
    let current = reopened.read_current_snapshot().unwrap().unwrap();
    assert!(current.verify_hash());

    // Persisted scores match a replay of the persisted log.
    let audit = audit_scores(&reopened, &config.decay, 1e-9).unwrap();
    assert!(audit.is_clean(), "{:?}", audit.mismatches().collect::<Vec<_>>());
}
