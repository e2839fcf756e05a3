//! Domain types for the ensemble engine.

pub mod bar;
pub mod decision;
pub mod ids;
pub mod outcome;
pub mod signal;
pub mod snapshot;

pub use bar::Bar;
pub use decision::{ActionScores, Contribution, EnsembleDecision};
pub use ids::{SnapshotVersion, StrategyId};
pub use outcome::OutcomeSample;
pub use signal::{Action, Signal, SignalError};
pub use snapshot::{RankingSnapshot, SnapshotCandidate, WeightTransform};

/// Instrument symbol type alias.
pub type Symbol = String;

/// Timestamp type used throughout the engine.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
