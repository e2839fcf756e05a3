//! Evaluation metrics: pure functions over realized per-trade returns.
//!
//! Every metric is a pure function: returns in, scalar out.

use ensemble_core::evaluation::EvaluationMetrics;

/// Compute TEST metrics from the number of decisions made and the realized,
/// direction-adjusted return of every BUY/SELL decision.
pub fn compute(decisions: usize, trade_returns: &[f64]) -> EvaluationMetrics {
    let trades = trade_returns.len();
    let hits = trade_returns.iter().filter(|r| **r > 0.0).count();
    let mean_return = mean(trade_returns);
    let return_std = std_dev(trade_returns);
    EvaluationMetrics {
        decisions,
        trades,
        hits,
        hit_rate: if trades > 0 { hits as f64 / trades as f64 } else { 0.0 },
        total_return: total_return(trade_returns),
        mean_return,
        return_std,
        sharpe: sharpe(trade_returns),
        max_drawdown: max_drawdown(trade_returns),
    }
}

// ─── Individual metric functions ────────────────────────────────────

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation. 0.0 for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Compounded return of taking every trade in sequence with full capital.
pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Mean over standard deviation, per trade. 0.0 when variance is zero.
pub fn sharpe(returns: &[f64]) -> f64 {
    let std = std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean(returns) / std
}

/// Largest peak-to-trough decline of the compounded equity curve, as a
/// positive fraction.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        equity *= 1.0 + r;
        peak = peak.max(equity);
        if peak > 0.0 {
            worst = worst.max((peak - equity) / peak);
        }
    }
    worst
}
