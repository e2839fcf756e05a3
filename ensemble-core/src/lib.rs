//! Ensemble Core: strategy scoring, ranking, and weighted ensemble decisions.
//!
//! This crate contains the decision engine:
//! - Domain types (signals, outcome samples, ranking snapshots, decisions)
//! - Performance tracker with exponentially decayed, replayable scores
//! - Ranking engine producing validated, versioned weight snapshots
//! - Pure ensemble aggregator (weighted vote, ties resolve to HOLD)
//! - Signal source trait, built-in sources, factory, and registry
//! - Persistence interface with in-memory and file-backed stores

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod domain;
pub mod evaluation;
pub mod ranking;
pub mod registry;
pub mod source;
pub mod store;
pub mod tracker;

pub use aggregator::EnsembleAggregator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use ranking::{RankingEngine, StrategyScore};
pub use registry::StrategyRegistry;
pub use store::{FileStore, MemoryStore, RankingStore, SnapshotSource};
pub use tracker::PerformanceTracker;
