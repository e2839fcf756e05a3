//! In-memory store: the reference implementation used by tests and replays.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};

use crate::domain::{OutcomeSample, RankingSnapshot, SnapshotVersion};
use crate::evaluation::EvaluationRecord;
use crate::tracker::ScoreBoard;

use super::{check_integrity, RankingStore, SnapshotSource, StoreError};

#[derive(Debug, Default)]
struct Inner {
    outcomes: Vec<OutcomeSample>,
    scores: ScoreBoard,
    snapshots: BTreeMap<SnapshotVersion, RankingSnapshot>,
    current: Option<SnapshotVersion>,
    evaluations: BTreeMap<SnapshotVersion, EvaluationRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    promotions: u32,
    reads: u32,
}

/// Thread-safe store held entirely in memory.
///
/// Fault injection makes the next N promotions or current-snapshot reads fail
/// with `Unavailable`, for exercising retry and fail-closed paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_promotions(&self, count: u32) {
        self.faults.lock().promotions = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.faults.lock().reads = count;
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    /// Overwrite a stored snapshot in place, bypassing write-once. Test hook
    /// for corruption handling.
    #[doc(hidden)]
    pub fn tamper(&self, snapshot: RankingSnapshot) {
        self.inner.write().snapshots.insert(snapshot.version, snapshot);
    }
}

impl SnapshotSource for MemoryStore {
    fn read_current_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError> {
        if Self::take_fault(&mut self.faults.lock().reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        let inner = self.inner.read();
        match inner.current {
            Some(v) => {
                let snapshot = inner.snapshots.get(&v).ok_or(StoreError::UnknownVersion(v))?;
                check_integrity(snapshot)?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    fn read_snapshot(&self, version: SnapshotVersion) -> Result<RankingSnapshot, StoreError> {
        let inner = self.inner.read();
        let snapshot = inner
            .snapshots
            .get(&version)
            .ok_or(StoreError::UnknownVersion(version))?;
        check_integrity(snapshot)?;
        Ok(snapshot.clone())
    }

    fn list_versions(&self) -> Result<Vec<SnapshotVersion>, StoreError> {
        Ok(self.inner.read().snapshots.keys().copied().collect())
    }

    fn current_version(&self) -> Result<Option<SnapshotVersion>, StoreError> {
        Ok(self.inner.read().current)
    }
}

impl RankingStore for MemoryStore {
    fn append(&self, sample: &OutcomeSample) -> Result<(), StoreError> {
        self.inner.write().outcomes.push(sample.clone());
        Ok(())
    }

    fn read_outcomes(&self) -> Result<Vec<OutcomeSample>, StoreError> {
        Ok(self.inner.read().outcomes.clone())
    }

    fn write_scores(&self, board: &ScoreBoard) -> Result<(), StoreError> {
        self.inner.write().scores = board.clone();
        Ok(())
    }

    fn read_current_scores(&self) -> Result<ScoreBoard, StoreError> {
        Ok(self.inner.read().scores.clone())
    }

    fn write_candidate_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.snapshots.contains_key(&snapshot.version) {
            return Err(StoreError::VersionExists(snapshot.version));
        }
        inner.snapshots.insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    fn promote(&self, version: SnapshotVersion) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let snapshot = inner
            .snapshots
            .get(&version)
            .ok_or(StoreError::UnknownVersion(version))?;
        check_integrity(snapshot)?;
        // The fault fires after the target was checked but before the swap,
        // i.e. mid-promotion.
        if Self::take_fault(&mut self.faults.lock().promotions) {
            return Err(StoreError::Unavailable("injected promotion failure".into()));
        }
        inner.current = Some(version);
        Ok(())
    }

    fn record_evaluation(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.snapshots.contains_key(&record.version) {
            return Err(StoreError::UnknownVersion(record.version));
        }
        inner.evaluations.insert(record.version, record.clone());
        Ok(())
    }

    fn read_evaluation(&self, version: SnapshotVersion) -> Result<Option<EvaluationRecord>, StoreError> {
        Ok(self.inner.read().evaluations.get(&version).cloned())
    }
}
