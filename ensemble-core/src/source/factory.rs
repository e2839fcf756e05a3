//! Factory: converts a `StrategyEntry` into a runtime signal source.

use crate::config::StrategyEntry;

use super::builtin::{Breakout, MaCrossover, MeanReversion, Momentum};
use super::SignalSource;

// ─── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FactoryError {
    #[error("Unknown signal source kind: {0}")]
    UnknownSource(String),
    #[error("Invalid parameter '{param}' for strategy '{id}': {reason}")]
    InvalidParam {
        id: String,
        param: &'static str,
        reason: String,
    },
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn param(entry: &StrategyEntry, name: &str, default: f64) -> f64 {
    entry.params.get(name).copied().unwrap_or(default)
}

fn param_usize(entry: &StrategyEntry, name: &'static str, default: usize) -> Result<usize, FactoryError> {
    let raw = param(entry, name, default as f64);
    if !raw.is_finite() || raw < 1.0 || raw.fract() != 0.0 {
        return Err(FactoryError::InvalidParam {
            id: entry.id.to_string(),
            param: name,
            reason: format!("expected a positive integer, got {raw}"),
        });
    }
    Ok(raw as usize)
}

fn positive(entry: &StrategyEntry, name: &'static str, default: f64) -> Result<f64, FactoryError> {
    let raw = param(entry, name, default);
    if !raw.is_finite() || raw <= 0.0 {
        return Err(FactoryError::InvalidParam {
            id: entry.id.to_string(),
            param: name,
            reason: format!("must be > 0, got {raw}"),
        });
    }
    Ok(raw)
}

// ─── Source factory ──────────────────────────────────────────────────

/// Build a signal source from config. Missing params fall back to defaults.
pub fn create_source(entry: &StrategyEntry) -> Result<Box<dyn SignalSource>, FactoryError> {
    let id = entry.id.clone();
    match entry.kind.as_str() {
        "momentum" => {
            let lookback = param_usize(entry, "lookback", 20)?;
            let threshold = positive(entry, "threshold", 0.02)?;
            Ok(Box::new(Momentum::new(id, lookback, threshold)))
        }
        "mean_reversion" => {
            let lookback = param_usize(entry, "lookback", 10)?;
            if lookback < 2 {
                return Err(FactoryError::InvalidParam {
                    id: entry.id.to_string(),
                    param: "lookback",
                    reason: "needs at least 2 bars for a deviation".into(),
                });
            }
            let band = positive(entry, "band", 1.5)?;
            Ok(Box::new(MeanReversion::new(id, lookback, band)))
        }
        "ma_crossover" => {
            let fast = param_usize(entry, "fast", 10)?;
            let slow = param_usize(entry, "slow", 30)?;
            if fast >= slow {
                return Err(FactoryError::InvalidParam {
                    id: entry.id.to_string(),
                    param: "fast",
                    reason: format!("fast ({fast}) must be below slow ({slow})"),
                });
            }
            Ok(Box::new(MaCrossover::new(id, fast, slow)))
        }
        "breakout" => {
            let lookback = param_usize(entry, "lookback", 50)?;
            Ok(Box::new(Breakout::new(id, lookback)))
        }
        other => Err(FactoryError::UnknownSource(other.to_string())),
    }
}
