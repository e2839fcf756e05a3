//! Ensemble Runner: lifecycle coordination on top of `ensemble-core`.
//!
//! This crate provides:
//! - Market data loading with CSV and deterministic synthetic fallback
//! - Signal collection, inline for replays and threaded with a per-tick
//!   timeout for LIVE
//! - Outcome realization over a fixed holding horizon
//! - The ranking process (cadence-driven recompute and optional promotion)
//! - TRAIN / TEST / PUSH / LIVE lifecycle modes
//! - Evaluation metrics, execution adapter with a paper broker
//! - Score audit and artifact export

pub mod audit;
pub mod collector;
pub mod execution;
pub mod export;
pub mod lifecycle;
pub mod market;
pub mod metrics;
pub mod outcomes;
pub mod ranking_process;

pub use audit::{audit_scores, AuditEntry, AuditReport};
pub use collector::{
    AbstainReason, Abstention, CollectedSignals, InlineCollector, SignalCollector, ThreadedCollector,
};
pub use execution::{ExecutionAdapter, ExecutionError, ExecutionReport, OrderStatus, PaperBroker};
pub use export::{save_artifacts, EvaluationManifest};
pub use lifecycle::{
    promote_with_retry, push, split_ticks, test, train, LifecycleError, LiveTick, LiveTrader, Mode,
    PushOptions, PushReport, TestReport, TrainReport,
};
pub use market::{load_market, LoadError, LoadOptions, LoadedMarket, MarketData};
pub use outcomes::{HorizonBook, OutcomeBook};
pub use ranking_process::{ProcessStats, PromotionPolicy, RankingProcess};
