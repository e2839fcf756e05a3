use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable strategy identity.
///
/// Ordered lexicographically; the ordering is the deterministic tie-break
/// used by the ranking engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub String);

impl StrategyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Monotonically increasing ranking snapshot version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(pub u64);

impl SnapshotVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_ids_order_lexicographically() {
        let mut ids = vec![StrategyId::from("rsi"), StrategyId::from("adx"), StrategyId::from("macd")];
        ids.sort();
        assert_eq!(ids, vec!["adx".into(), "macd".into(), "rsi".into()]);
    }

    #[test]
    fn version_increments() {
        assert_eq!(SnapshotVersion(3).next(), SnapshotVersion(4));
        assert_eq!(SnapshotVersion(7).to_string(), "v7");
    }

    #[test]
    fn strategy_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&StrategyId::from("momentum_20")).unwrap();
        assert_eq!(json, "\"momentum_20\"");
    }
}
