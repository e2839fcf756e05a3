//! File-backed store.
//!
//! Layout under the store root:
//!
//! ```text
//! outcomes.jsonl          append-only outcome log, one sample per line
//! scores.json             latest ScoreBoard
//! snapshots/v{N}.json     finalized snapshots, write-once
//! evaluations/v{N}.json   TEST verdicts
//! CURRENT                 promoted version ("v{N}")
//! ```
//!
//! Every whole-file write goes to a unique temp file, is fsynced, then renamed
//! into place, so a crash or a concurrent reader never sees a torn file.
//! Promotion is one such rename of `CURRENT`.
//!
//! The outcome log is the one file written in place. A crash mid-append can
//! leave an unterminated last line; it is cut off before the next append so a
//! later record never gets glued onto the fragment.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::domain::{OutcomeSample, RankingSnapshot, SnapshotVersion};
use crate::evaluation::EvaluationRecord;
use crate::tracker::ScoreBoard;

use super::{check_integrity, RankingStore, SnapshotSource, StoreError};

const OUTCOMES: &str = "outcomes.jsonl";
const SCORES: &str = "scores.json";
const SNAPSHOTS: &str = "snapshots";
const EVALUATIONS: &str = "evaluations";
const CURRENT: &str = "CURRENT";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.clone(), root.join(SNAPSHOTS), root.join(EVALUATIONS)] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        let log = root.join(OUTCOMES);
        match OpenOptions::new().read(true).write(true).open(&log) {
            Ok(mut file) => drop_torn_tail(&mut file, &log)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&log, e)),
        }
        Ok(Self {
            root,
            append_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, version: SnapshotVersion) -> PathBuf {
        self.root.join(SNAPSHOTS).join(format!("{version}.json"))
    }

    fn evaluation_path(&self, version: SnapshotVersion) -> PathBuf {
        self.root.join(EVALUATIONS).join(format!("{version}.json"))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

/// Temp file next to `path`, unique per process and call.
fn temp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(dir) => File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::io(dir, e)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// Replace `path` atomically with `bytes`.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = temp_path(path);
    write_synced(&tmp, bytes)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })?;
    sync_dir(path)
}

/// Create `path` atomically with `bytes`; fails if it already exists.
fn atomic_create(path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
    let tmp = temp_path(path);
    write_synced(&tmp, bytes)?;
    // hard_link refuses to clobber, which makes the publish step write-once.
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => {
            sync_dir(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Truncate an unterminated last line left by an interrupted append.
///
/// An append is only acknowledged after its newline is synced, so the
/// fragment was never reported as stored and is safe to drop.
fn drop_torn_tail(file: &mut File, path: &Path) -> Result<(), StoreError> {
    let io_err = |e: io::Error| StoreError::io(path, e);
    let len = file.metadata().map_err(io_err)?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).map_err(io_err)?;
    file.read_exact(&mut last).map_err(io_err)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    let mut bytes = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    file.read_to_end(&mut bytes).map_err(io_err)?;
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep as u64,
        "dropping torn tail of outcome log"
    );
    file.set_len(keep as u64).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec_pretty(value)?)
}

fn parse_version(text: &str) -> Option<SnapshotVersion> {
    text.trim()
        .strip_prefix('v')
        .and_then(|n| n.parse().ok())
        .map(SnapshotVersion)
}

impl SnapshotSource for FileStore {
    fn read_current_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError> {
        match self.current_version()? {
            Some(v) => self.read_snapshot(v).map(Some),
            None => Ok(None),
        }
    }

    fn read_snapshot(&self, version: SnapshotVersion) -> Result<RankingSnapshot, StoreError> {
        let path = self.snapshot_path(version);
        let snapshot: RankingSnapshot = self
            .read_json(&path)
            .map_err(|e| match e {
                StoreError::Serde(err) => StoreError::Corrupted {
                    version,
                    reason: err.to_string(),
                },
                other => other,
            })?
            .ok_or(StoreError::UnknownVersion(version))?;
        if snapshot.version != version {
            return Err(StoreError::Corrupted {
                version,
                reason: format!("file holds {}", snapshot.version),
            });
        }
        check_integrity(&snapshot)?;
        Ok(snapshot)
    }

    fn list_versions(&self) -> Result<Vec<SnapshotVersion>, StoreError> {
        let dir = self.root.join(SNAPSHOTS);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(v) = name.strip_suffix(".json").and_then(parse_version) {
                versions.push(v);
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn current_version(&self) -> Result<Option<SnapshotVersion>, StoreError> {
        let path = self.root.join(CURRENT);
        match fs::read_to_string(&path) {
            Ok(text) => parse_version(&text).map(Some).ok_or_else(|| StoreError::Corrupted {
                version: SnapshotVersion(0),
                reason: format!("unreadable CURRENT pointer: {text:?}"),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

impl RankingStore for FileStore {
    fn append(&self, sample: &OutcomeSample) -> Result<(), StoreError> {
        let line = serde_json::to_string(sample)?;
        let path = self.root.join(OUTCOMES);
        let _guard = self.append_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        // A failed write earlier in this process can leave a fragment too.
        drop_torn_tail(&mut file, &path)?;
        writeln!(file, "{line}").map_err(|e| StoreError::io(&path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&path, e))
    }

    fn read_outcomes(&self) -> Result<Vec<OutcomeSample>, StoreError> {
        let path = self.root.join(OUTCOMES);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut samples = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(sample) => samples.push(sample),
                // A torn final line after a crash is skipped, not fatal.
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed outcome record"),
            }
        }
        Ok(samples)
    }

    fn write_scores(&self, board: &ScoreBoard) -> Result<(), StoreError> {
        atomic_write(&self.root.join(SCORES), &to_pretty_json(board)?)
    }

    fn read_current_scores(&self) -> Result<ScoreBoard, StoreError> {
        Ok(self.read_json(&self.root.join(SCORES))?.unwrap_or_default())
    }

    fn write_candidate_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError> {
        let path = self.snapshot_path(snapshot.version);
        if atomic_create(&path, &to_pretty_json(snapshot)?)? {
            Ok(())
        } else {
            Err(StoreError::VersionExists(snapshot.version))
        }
    }

    fn promote(&self, version: SnapshotVersion) -> Result<(), StoreError> {
        // Refuse to point CURRENT at anything a reader could not load.
        self.read_snapshot(version)?;
        atomic_write(&self.root.join(CURRENT), format!("{version}\n").as_bytes())
    }

    fn record_evaluation(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        if !self.snapshot_path(record.version).exists() {
            return Err(StoreError::UnknownVersion(record.version));
        }
        atomic_write(&self.evaluation_path(record.version), &to_pretty_json(record)?)
    }

    fn read_evaluation(&self, version: SnapshotVersion) -> Result<Option<EvaluationRecord>, StoreError> {
        self.read_json(&self.evaluation_path(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SnapshotCandidate, WeightTransform};
    use chrono::{TimeZone, Utc};

    fn snapshot(version: u64, weights: &[(&str, f64)]) -> RankingSnapshot {
        let candidate = SnapshotCandidate {
            weights: weights.iter().map(|(id, w)| ((*id).into(), *w)).collect(),
            ranking_order: weights.iter().map(|(id, _)| (*id).into()).collect(),
            scores: weights.iter().map(|(id, _)| ((*id).into(), 0.0)).collect(),
            transform: WeightTransform::default(),
        };
        RankingSnapshot::from_candidate(
            candidate,
            SnapshotVersion(version),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn snapshot_roundtrip_and_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let snap = snapshot(1, &[("a", 0.25), ("b", 0.75)]);
        store.write_candidate_snapshot(&snap).unwrap();
        assert_eq!(store.current_version().unwrap(), None);
        store.promote(SnapshotVersion(1)).unwrap();
        assert_eq!(store.read_current_snapshot().unwrap(), Some(snap));
        assert_eq!(
            fs::read_to_string(dir.path().join(CURRENT)).unwrap().trim(),
            "v1"
        );
    }

    #[test]
    fn write_once_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write_candidate_snapshot(&snapshot(1, &[("a", 1.0)])).unwrap();
        assert!(matches!(
            store.write_candidate_snapshot(&snapshot(1, &[("a", 1.0)])),
            Err(StoreError::VersionExists(_))
        ));
    }

    #[test]
    fn list_versions_sorted_and_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for v in [3, 1, 10] {
            store.write_candidate_snapshot(&snapshot(v, &[("a", 1.0)])).unwrap();
        }
        fs::write(dir.path().join(SNAPSHOTS).join(".v4.json.1.1.tmp"), b"{").unwrap();
        let versions = store.list_versions().unwrap();
        assert_eq!(versions, vec![SnapshotVersion(1), SnapshotVersion(3), SnapshotVersion(10)]);
        assert_eq!(store.latest_version().unwrap(), Some(SnapshotVersion(10)));
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut snap = snapshot(1, &[("a", 0.5), ("b", 0.5)]);
        store.write_candidate_snapshot(&snap).unwrap();
        snap.weights.insert("a".into(), 0.9);
        fs::write(
            dir.path().join(SNAPSHOTS).join("v1.json"),
            serde_json::to_vec(&snap).unwrap(),
        )
        .unwrap();
        assert!(matches!(store.read_snapshot(SnapshotVersion(1)), Err(StoreError::Corrupted { .. })));
        assert!(store.promote(SnapshotVersion(1)).is_err());
        assert_eq!(store.current_version().unwrap(), None);
    }

    #[test]
    fn truncated_snapshot_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(SNAPSHOTS).join("v2.json"), b"{\"version\": 2, \"wei").unwrap();
        assert!(matches!(store.read_snapshot(SnapshotVersion(2)), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn outcome_log_appends_and_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let sample = OutcomeSample {
            strategy_id: "a".into(),
            instrument: "SPY".into(),
            signal_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            realized_return: 0.01,
        };
        store.append(&sample).unwrap();
        store.append(&sample).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(OUTCOMES))
            .unwrap();
        write!(file, "{{\"strategy_id\":\"a\",\"instr").unwrap();
        assert_eq!(store.read_outcomes().unwrap(), vec![sample.clone(), sample]);
    }

    #[test]
    fn computed_weights_read_back_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for v in 1..=200u64 {
            let raw: Vec<f64> = (0..5)
                .map(|_| {
                    seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    ((seed >> 11) as f64 / (1u64 << 53) as f64).exp()
                })
                .collect();
            let total: f64 = raw.iter().sum();
            let ids = ["a", "b", "c", "d", "e"];
            let weights: Vec<(&str, f64)> =
                ids.iter().zip(&raw).map(|(id, w)| (*id, w / total)).collect();
            let snap = snapshot(v, &weights);
            store.write_candidate_snapshot(&snap).unwrap();
            let back = store.read_snapshot(SnapshotVersion(v)).unwrap();
            assert!(back.verify_hash());
            for (id, w) in &snap.weights {
                assert_eq!(back.weights[id].to_bits(), w.to_bits());
            }
            store.promote(SnapshotVersion(v)).unwrap();
        }
        assert_eq!(store.current_version().unwrap(), Some(SnapshotVersion(200)));
    }

    fn outcome(instrument: &str) -> OutcomeSample {
        OutcomeSample {
            strategy_id: "a".into(),
            instrument: instrument.into(),
            signal_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            realized_return: 1.0 / 3.0,
        }
    }

    #[test]
    fn reopen_cuts_torn_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let first = outcome("SPY");
        let second = outcome("QQQ");
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.append(&first).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(OUTCOMES))
            .unwrap();
        write!(file, "{{\"strategy_id\":\"a\",\"instr").unwrap();
        drop(file);

        let store = FileStore::open(dir.path()).unwrap();
        store.append(&second).unwrap();
        assert_eq!(store.read_outcomes().unwrap(), vec![first, second]);
        let text = fs::read_to_string(dir.path().join(OUTCOMES)).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn append_cuts_torn_tail_left_mid_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let first = outcome("SPY");
        let second = outcome("QQQ");
        store.append(&first).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(OUTCOMES))
            .unwrap();
        write!(file, "{{\"strat").unwrap();
        drop(file);
        store.append(&second).unwrap();
        assert_eq!(store.read_outcomes().unwrap(), vec![first, second]);
    }

    #[test]
    fn torn_only_line_leaves_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(OUTCOMES), b"{\"strategy_id\":").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.read_outcomes().unwrap().is_empty());
        assert_eq!(fs::metadata(dir.path().join(OUTCOMES)).unwrap().len(), 0);
    }

    #[test]
    fn scores_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.read_current_scores().unwrap().is_empty());
        let mut board = ScoreBoard::new();
        board.insert("a".into(), Default::default());
        store.write_scores(&board).unwrap();
        assert_eq!(store.read_current_scores().unwrap(), board);
    }

    #[test]
    fn reopen_sees_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.write_candidate_snapshot(&snapshot(1, &[("a", 1.0)])).unwrap();
            store.promote(SnapshotVersion(1)).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.current_version().unwrap(), Some(SnapshotVersion(1)));
    }
}
