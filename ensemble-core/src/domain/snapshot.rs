//! Ranking snapshots: immutable, versioned strategy weight sets.
//!
//! A `SnapshotCandidate` is what the ranking engine computes. Only after it
//! passes validation and is finalized does it become a `RankingSnapshot`
//! with a version and a creation time. Finalized snapshots are never
//! mutated; older versions are retained for audit and replay.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{SnapshotVersion, StrategyId, Timestamp};

/// Monotonic transform from performance scores to raw (pre-floor) weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightTransform {
    /// `exp((score - max) / temperature)`; lower temperature sharpens the ranking.
    Softmax { temperature: f64 },
    /// `(score - min) / (max - min)`; a flat population maps to equal weights.
    MinMax,
}

impl Default for WeightTransform {
    fn default() -> Self {
        Self::Softmax { temperature: 1.0 }
    }
}

/// Unversioned output of `RankingEngine::compute_snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCandidate {
    pub weights: BTreeMap<StrategyId, f64>,
    /// Strategy ids by descending score, ties broken by ascending id.
    pub ranking_order: Vec<StrategyId>,
    /// Scores the weights were derived from, kept for audit.
    pub scores: BTreeMap<StrategyId, f64>,
    pub transform: WeightTransform,
}

impl SnapshotCandidate {
    /// Content hash over `(weights, ranking_order)`.
    ///
    /// Two candidates computed from identical inputs hash identically, which
    /// is how repeated recomputation is recognized as idempotent.
    pub fn content_hash(&self) -> String {
        content_hash(&self.weights, &self.ranking_order)
    }
}

/// A finalized ranking snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub version: SnapshotVersion,
    pub created_at: Timestamp,
    pub weights: BTreeMap<StrategyId, f64>,
    pub ranking_order: Vec<StrategyId>,
    pub scores: BTreeMap<StrategyId, f64>,
    pub transform: WeightTransform,
    pub content_hash: String,
}

impl RankingSnapshot {
    pub fn from_candidate(
        candidate: SnapshotCandidate,
        version: SnapshotVersion,
        created_at: Timestamp,
    ) -> Self {
        let content_hash = candidate.content_hash();
        Self {
            version,
            created_at,
            weights: candidate.weights,
            ranking_order: candidate.ranking_order,
            scores: candidate.scores,
            transform: candidate.transform,
            content_hash,
        }
    }

    /// Weight of a strategy; strategies absent from the snapshot weigh zero.
    pub fn weight(&self, id: &StrategyId) -> f64 {
        self.weights.get(id).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, id: &StrategyId) -> bool {
        self.weights.contains_key(id)
    }

    /// 1-based rank of a strategy, if present.
    pub fn rank_of(&self, id: &StrategyId) -> Option<usize> {
        self.ranking_order.iter().position(|s| s == id).map(|i| i + 1)
    }

    /// Recompute the content hash and compare with the stored one.
    pub fn verify_hash(&self) -> bool {
        content_hash(&self.weights, &self.ranking_order) == self.content_hash
    }

    /// Back to a candidate (drops version and timestamp), e.g. to re-validate
    /// a stored snapshot against the current registry before promotion.
    pub fn to_candidate(&self) -> SnapshotCandidate {
        SnapshotCandidate {
            weights: self.weights.clone(),
            ranking_order: self.ranking_order.clone(),
            scores: self.scores.clone(),
            transform: self.transform,
        }
    }
}

fn content_hash(weights: &BTreeMap<StrategyId, f64>, order: &[StrategyId]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"weights");
    for (id, w) in weights {
        hasher.update(id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&w.to_bits().to_le_bytes());
    }
    hasher.update(b"order");
    for id in order {
        hasher.update(id.as_str().as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candidate() -> SnapshotCandidate {
        let mut weights = BTreeMap::new();
        weights.insert(StrategyId::from("a"), 0.7);
        weights.insert(StrategyId::from("b"), 0.3);
        let mut scores = BTreeMap::new();
        scores.insert(StrategyId::from("a"), 2.0);
        scores.insert(StrategyId::from("b"), 1.0);
        SnapshotCandidate {
            weights,
            ranking_order: vec!["a".into(), "b".into()],
            scores,
            transform: WeightTransform::MinMax,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(candidate().content_hash(), candidate().content_hash());
    }

    #[test]
    fn hash_changes_with_weights() {
        let mut other = candidate();
        other.weights.insert("a".into(), 0.69);
        assert_ne!(candidate().content_hash(), other.content_hash());
    }

    #[test]
    fn hash_changes_with_order() {
        let mut other = candidate();
        other.ranking_order.reverse();
        assert_ne!(candidate().content_hash(), other.content_hash());
    }

    #[test]
    fn finalized_snapshot_keeps_hash_and_lookups() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).unwrap();
        let snap = RankingSnapshot::from_candidate(candidate(), SnapshotVersion(1), ts);
        assert!(snap.verify_hash());
        assert_eq!(snap.weight(&"a".into()), 0.7);
        assert_eq!(snap.weight(&"zzz".into()), 0.0);
        assert_eq!(snap.rank_of(&"b".into()), Some(2));
        assert_eq!(snap.to_candidate(), candidate());
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).unwrap();
        let mut snap = RankingSnapshot::from_candidate(candidate(), SnapshotVersion(1), ts);
        snap.weights.insert("b".into(), 0.31);
        assert!(!snap.verify_hash());
    }

    #[test]
    fn transform_toml_shape() {
        let t: WeightTransform = toml::from_str("kind = \"softmax\"\ntemperature = 0.5").unwrap();
        assert_eq!(t, WeightTransform::Softmax { temperature: 0.5 });
        let t: WeightTransform = toml::from_str("kind = \"min_max\"").unwrap();
        assert_eq!(t, WeightTransform::MinMax);
    }
}
