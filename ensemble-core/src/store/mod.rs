//! Persistence interface for outcomes, scores, snapshots, and evaluations.
//!
//! The read side (`SnapshotSource`) is all a LIVE trading process gets. The
//! write side (`RankingStore`) belongs to the ranking process and the
//! lifecycle coordinator. Promotion is a single-key swap of the current
//! pointer; readers observe either the old or the new snapshot, never a mix.

pub mod file;
pub mod memory;

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{OutcomeSample, RankingSnapshot, SnapshotVersion};
use crate::evaluation::EvaluationRecord;
use crate::tracker::ScoreBoard;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot {0} already exists")]
    VersionExists(SnapshotVersion),
    #[error("snapshot {0} not found")]
    UnknownVersion(SnapshotVersion),
    #[error("snapshot {version} is corrupted: {reason}")]
    Corrupted {
        version: SnapshotVersion,
        reason: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors worth retrying (the store may recover on its own).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::Unavailable(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Read-only view of finalized snapshots.
pub trait SnapshotSource: Send + Sync {
    /// The promoted snapshot, or `None` if nothing was ever promoted.
    fn read_current_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError>;

    fn read_snapshot(&self, version: SnapshotVersion) -> Result<RankingSnapshot, StoreError>;

    /// Every persisted snapshot version, ascending.
    fn list_versions(&self) -> Result<Vec<SnapshotVersion>, StoreError>;

    fn current_version(&self) -> Result<Option<SnapshotVersion>, StoreError>;

    fn latest_version(&self) -> Result<Option<SnapshotVersion>, StoreError> {
        Ok(self.list_versions()?.last().copied())
    }
}

/// Full read/write store used by the ranking side.
pub trait RankingStore: SnapshotSource {
    /// Append one outcome sample to the log. Never rewrites earlier entries.
    fn append(&self, sample: &OutcomeSample) -> Result<(), StoreError>;

    fn read_outcomes(&self) -> Result<Vec<OutcomeSample>, StoreError>;

    fn write_scores(&self, board: &ScoreBoard) -> Result<(), StoreError>;

    fn read_current_scores(&self) -> Result<ScoreBoard, StoreError>;

    /// Persist a finalized snapshot. Fails with `VersionExists` if the version
    /// was already written; snapshots are write-once.
    fn write_candidate_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError>;

    /// Atomically make `version` the current snapshot. The version must
    /// already be persisted and intact.
    fn promote(&self, version: SnapshotVersion) -> Result<(), StoreError>;

    fn record_evaluation(&self, record: &EvaluationRecord) -> Result<(), StoreError>;

    fn read_evaluation(&self, version: SnapshotVersion) -> Result<Option<EvaluationRecord>, StoreError>;
}

pub(crate) fn check_integrity(snapshot: &RankingSnapshot) -> Result<(), StoreError> {
    if snapshot.verify_hash() {
        Ok(())
    } else {
        Err(StoreError::Corrupted {
            version: snapshot.version,
            reason: "content hash mismatch".into(),
        })
    }
}
