//! Engine configuration: one TOML document for every component.
//!
//! ```toml
//! universe = ["AAPL", "MSFT"]
//!
//! [decay]
//! half_life_secs = 432000.0
//!
//! [ranking]
//! transform = { kind = "softmax", temperature = 0.5 }
//! min_weight = 0.01
//!
//! [[strategies]]
//! id = "momentum_20"
//! kind = "momentum"
//! params = { lookback = 20.0 }
//! ```
//!
//! Every section has defaults, so a file only needs to name what it changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{StrategyId, WeightTransform};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("duplicate strategy id '{0}'")]
    DuplicateStrategy(StrategyId),
    #[error("universe is empty")]
    EmptyUniverse,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ─── Decay ───────────────────────────────────────────────────────────

/// Magnitude band: signals whose |return| falls below `max_abs_return`
/// have their hit/miss indicator scaled by `multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeTier {
    pub max_abs_return: f64,
    pub multiplier: f64,
}

/// Performance score decay and contribution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Time constant of the decay factor `exp(-Δt / half_life)`, in seconds.
    pub half_life_secs: f64,
    /// Weight of the hit/miss indicator in a sample's contribution.
    pub hit_weight: f64,
    /// Weight of the (clipped) realized return in a sample's contribution.
    pub return_weight: f64,
    /// Realized returns are clipped to `[-return_clip, return_clip]`.
    pub return_clip: f64,
    /// Score reported for strategies without samples.
    pub neutral_score: f64,
    /// Ordered by ascending `max_abs_return`. Returns beyond the last band
    /// use the last multiplier.
    pub tiers: Vec<MagnitudeTier>,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 5.0 * 86_400.0,
            hit_weight: 1.0,
            return_weight: 10.0,
            return_clip: 0.2,
            neutral_score: 0.0,
            tiers: vec![
                MagnitudeTier {
                    max_abs_return: 0.01,
                    multiplier: 1.0,
                },
                MagnitudeTier {
                    max_abs_return: 0.10,
                    multiplier: 1.1,
                },
                MagnitudeTier {
                    max_abs_return: 1.0,
                    multiplier: 1.2,
                },
            ],
        }
    }
}

impl DecayConfig {
    /// Indicator multiplier for a return of the given magnitude.
    pub fn tier_multiplier(&self, realized_return: f64) -> f64 {
        let magnitude = realized_return.abs();
        self.tiers
            .iter()
            .find(|t| magnitude < t.max_abs_return)
            .or(self.tiers.last())
            .map_or(1.0, |t| t.multiplier)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.half_life_secs.is_finite() && self.half_life_secs > 0.0) {
            return Err(invalid("decay.half_life_secs", "must be a positive number of seconds"));
        }
        if !(self.hit_weight.is_finite() && self.hit_weight >= 0.0) {
            return Err(invalid("decay.hit_weight", "must be >= 0"));
        }
        if !(self.return_weight.is_finite() && self.return_weight >= 0.0) {
            return Err(invalid("decay.return_weight", "must be >= 0"));
        }
        if !(self.return_clip.is_finite() && self.return_clip > 0.0) {
            return Err(invalid("decay.return_clip", "must be > 0"));
        }
        if !self.neutral_score.is_finite() {
            return Err(invalid("decay.neutral_score", "must be finite"));
        }
        let ascending = self
            .tiers
            .windows(2)
            .all(|w| w[0].max_abs_return < w[1].max_abs_return);
        if !ascending {
            return Err(invalid("decay.tiers", "bands must have ascending max_abs_return"));
        }
        if self
            .tiers
            .iter()
            .any(|t| !(t.multiplier.is_finite() && t.multiplier >= 0.0))
        {
            return Err(invalid("decay.tiers", "multipliers must be finite and >= 0"));
        }
        Ok(())
    }
}

// ─── Ranking ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Floor applied to every strategy that has samples.
    pub min_weight: f64,
    /// Fixed weight given to strategies without samples (cold start).
    pub cold_start_weight: f64,
    /// Allowed deviation of the weight sum from 1.
    pub sum_tolerance: f64,
    /// Recompute cadence of the ranking process, in ticks.
    pub recompute_every: usize,
    pub transform: WeightTransform,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            min_weight: 0.01,
            cold_start_weight: 0.05,
            sum_tolerance: 1e-9,
            recompute_every: 20,
            transform: WeightTransform::default(),
        }
    }
}

impl RankingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let WeightTransform::Softmax { temperature } = self.transform {
            if !(temperature.is_finite() && temperature > 0.0) {
                return Err(invalid("ranking.transform.temperature", "must be > 0"));
            }
        }
        if !(0.0..=1.0).contains(&self.min_weight) {
            return Err(invalid("ranking.min_weight", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.cold_start_weight) {
            return Err(invalid("ranking.cold_start_weight", "must be within [0, 1]"));
        }
        if !(self.sum_tolerance.is_finite() && self.sum_tolerance > 0.0) {
            return Err(invalid("ranking.sum_tolerance", "must be > 0"));
        }
        if self.recompute_every == 0 {
            return Err(invalid("ranking.recompute_every", "must be at least one tick"));
        }
        Ok(())
    }
}

// ─── Ensemble ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Action scores closer than this are a tie, and ties resolve to HOLD.
    pub tie_epsilon: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self { tie_epsilon: 1e-9 }
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────

/// Thresholds a TEST evaluation must meet before PUSH accepts a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestGate {
    pub min_trades: usize,
    pub min_hit_rate: f64,
    pub min_total_return: f64,
}

impl Default for TestGate {
    fn default() -> Self {
        Self {
            min_trades: 5,
            min_hit_rate: 0.45,
            min_total_return: -0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Per-tick deadline for strategy responses in LIVE, in milliseconds.
    pub tick_timeout_ms: u64,
    /// Ticks per simulated evaluation window in TRAIN.
    pub evaluation_window: usize,
    /// Ticks between a signal and the price that realizes its outcome.
    pub holding_horizon: usize,
    /// Bars of history handed to each signal source.
    pub history_window: usize,
    /// Leading share of the timeline replayed by TRAIN; TEST gets the rest.
    pub train_fraction: f64,
    /// Extra promotion attempts after the first failure.
    pub promote_retries: u32,
    pub promote_backoff_ms: u64,
    /// PUSH refuses versions without a passing TEST evaluation.
    pub require_tested: bool,
    pub test_gate: TestGate,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_timeout_ms: 500,
            evaluation_window: 20,
            holding_horizon: 5,
            history_window: 60,
            train_fraction: 0.7,
            promote_retries: 3,
            promote_backoff_ms: 200,
            require_tested: true,
            test_gate: TestGate::default(),
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_timeout_ms == 0 {
            return Err(invalid("lifecycle.tick_timeout_ms", "must be > 0"));
        }
        if self.evaluation_window == 0 {
            return Err(invalid("lifecycle.evaluation_window", "must be at least one tick"));
        }
        if self.holding_horizon == 0 {
            return Err(invalid("lifecycle.holding_horizon", "must be at least one tick"));
        }
        if self.history_window == 0 {
            return Err(invalid("lifecycle.history_window", "must be at least one bar"));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(invalid("lifecycle.train_fraction", "must be within (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.test_gate.min_hit_rate) {
            return Err(invalid("lifecycle.test_gate.min_hit_rate", "must be within [0, 1]"));
        }
        Ok(())
    }
}

// ─── Store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ranking_store"),
        }
    }
}

// ─── Strategies ──────────────────────────────────────────────────────

/// One registered strategy: stable id, factory kind, numeric parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub id: StrategyId,
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

fn default_enabled() -> bool {
    true
}

impl StrategyEntry {
    pub fn new(id: &str, kind: &str, params: &[(&str, f64)]) -> Self {
        Self {
            id: StrategyId::from(id),
            kind: kind.to_string(),
            enabled: true,
            params: params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub universe: Vec<String>,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            universe: vec!["AAPL".into(), "MSFT".into(), "NVDA".into(), "SPY".into()],
            decay: DecayConfig::default(),
            ranking: RankingConfig::default(),
            ensemble: EnsembleConfig::default(),
            lifecycle: LifecycleConfig::default(),
            store: StoreConfig::default(),
            strategies: vec![
                StrategyEntry::new("momentum_20", "momentum", &[("lookback", 20.0), ("threshold", 0.02)]),
                StrategyEntry::new("mean_reversion_10", "mean_reversion", &[("lookback", 10.0), ("band", 1.5)]),
                StrategyEntry::new("ma_cross_10_30", "ma_crossover", &[("fast", 10.0), ("slow", 30.0)]),
                StrategyEntry::new("breakout_50", "breakout", &[("lookback", 50.0)]),
            ],
        }
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.universe.is_empty() {
            return Err(ConfigError::EmptyUniverse);
        }
        self.decay.validate()?;
        self.ranking.validate()?;
        if !(self.ensemble.tie_epsilon.is_finite() && self.ensemble.tie_epsilon >= 0.0) {
            return Err(invalid("ensemble.tie_epsilon", "must be >= 0"));
        }
        self.lifecycle.validate()?;

        let mut seen = BTreeSet::new();
        for entry in &self.strategies {
            if !seen.insert(&entry.id) {
                return Err(ConfigError::DuplicateStrategy(entry.id.clone()));
            }
        }
        Ok(())
    }
}
