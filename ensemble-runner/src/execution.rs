//! Trade execution boundary and an in-process paper broker.
//!
//! The adapter consumes ensemble decisions and nothing else; its failures are
//! reported back to the caller and never reach ranking state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use ensemble_core::domain::{Action, EnsembleDecision, Symbol, Timestamp};

/// Cash the paper broker always keeps in reserve.
pub const LIQUIDITY_FLOOR: f64 = 15_000.0;
/// Largest share of portfolio value a single holding may reach.
pub const MAX_POSITION_FRACTION: f64 = 0.1;
pub const DEFAULT_STARTING_CASH: f64 = 50_000.0;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid price {price} for {instrument}")]
    InvalidPrice { instrument: Symbol, price: f64 },
    #[error("order for {instrument} would breach the liquidity floor (cash {cash:.2}, notional {notional:.2})")]
    InsufficientLiquidity {
        instrument: Symbol,
        cash: f64,
        notional: f64,
    },
    #[error("{instrument} is already at the position limit")]
    PositionLimit { instrument: Symbol },
    #[error("no position in {0} to sell")]
    NoPosition(Symbol),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
    /// HOLD, or an order too small to buy a single share.
    NoOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub instrument: Symbol,
    pub timestamp: Timestamp,
    pub action: Action,
    pub quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub cash_after: f64,
}

pub trait ExecutionAdapter: Send {
    fn submit(&mut self, decision: &EnsembleDecision, price: f64) -> Result<ExecutionReport, ExecutionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrokerLimits {
    pub liquidity_floor: f64,
    pub max_position_fraction: f64,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            liquidity_floor: LIQUIDITY_FLOOR,
            max_position_fraction: MAX_POSITION_FRACTION,
        }
    }
}

/// Whole-share paper account. BUY sizes by `sizing_hint`; SELL closes the
/// entire position.
#[derive(Debug, Clone)]
pub struct PaperBroker {
    cash: f64,
    limits: BrokerLimits,
    holdings: BTreeMap<Symbol, f64>,
    last_price: BTreeMap<Symbol, f64>,
}

impl PaperBroker {
    pub fn new(cash: f64) -> Self {
        Self::with_limits(cash, BrokerLimits::default())
    }

    pub fn with_limits(cash: f64, limits: BrokerLimits) -> Self {
        Self {
            cash,
            limits,
            holdings: BTreeMap::new(),
            last_price: BTreeMap::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, instrument: &str) -> f64 {
        self.holdings.get(instrument).copied().unwrap_or(0.0)
    }

    pub fn holdings(&self) -> &BTreeMap<Symbol, f64> {
        &self.holdings
    }

    /// Cash plus holdings marked at the last price seen for each instrument.
    pub fn portfolio_value(&self) -> f64 {
        self.cash
            + self
                .holdings
                .iter()
                .map(|(sym, qty)| qty * self.last_price.get(sym).copied().unwrap_or(0.0))
                .sum::<f64>()
    }

    fn report(&self, decision: &EnsembleDecision, quantity: f64, price: f64, status: OrderStatus) -> ExecutionReport {
        ExecutionReport {
            instrument: decision.instrument.clone(),
            timestamp: decision.timestamp,
            action: decision.action,
            quantity,
            price,
            status,
            cash_after: self.cash,
        }
    }

    fn buy(&mut self, decision: &EnsembleDecision, price: f64) -> Result<ExecutionReport, ExecutionError> {
        let instrument = &decision.instrument;
        let total = self.portfolio_value();
        let cap = total * self.limits.max_position_fraction;
        let held = self.position(instrument) * price;
        if held >= cap {
            return Err(ExecutionError::PositionLimit {
                instrument: instrument.clone(),
            });
        }
        let target = (total * self.limits.max_position_fraction * decision.sizing_hint).min(cap - held);
        let quantity = (target / price).floor();
        if quantity < 1.0 {
            return Ok(self.report(decision, 0.0, price, OrderStatus::NoOrder));
        }
        let notional = quantity * price;
        if self.cash - notional < self.limits.liquidity_floor {
            return Err(ExecutionError::InsufficientLiquidity {
                instrument: instrument.clone(),
                cash: self.cash,
                notional,
            });
        }
        self.cash -= notional;
        *self.holdings.entry(instrument.clone()).or_insert(0.0) += quantity;
        info!(instrument = %instrument, quantity, price, cash = self.cash, "paper buy filled");
        Ok(self.report(decision, quantity, price, OrderStatus::Filled))
    }

    fn sell(&mut self, decision: &EnsembleDecision, price: f64) -> Result<ExecutionReport, ExecutionError> {
        let instrument = &decision.instrument;
        let quantity = self.position(instrument);
        if quantity <= 0.0 {
            return Err(ExecutionError::NoPosition(instrument.clone()));
        }
        self.holdings.remove(instrument);
        self.cash += quantity * price;
        info!(instrument = %instrument, quantity, price, cash = self.cash, "paper sell filled");
        Ok(self.report(decision, quantity, price, OrderStatus::Filled))
    }
}

impl ExecutionAdapter for PaperBroker {
    fn submit(&mut self, decision: &EnsembleDecision, price: f64) -> Result<ExecutionReport, ExecutionError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(ExecutionError::InvalidPrice {
                instrument: decision.instrument.clone(),
                price,
            });
        }
        self.last_price.insert(decision.instrument.clone(), price);
        match decision.action {
            Action::Hold => {
                debug!(instrument = %decision.instrument, "hold, no order");
                Ok(self.report(decision, 0.0, price, OrderStatus::NoOrder))
            }
            Action::Buy => self.buy(decision, price),
            Action::Sell => self.sell(decision, price),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ensemble_core::domain::ActionScores;

    fn decision(action: Action, sizing_hint: f64) -> EnsembleDecision {
        EnsembleDecision {
            instrument: "AAPL".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
            action,
            aggregate_score: sizing_hint,
            scores: ActionScores::default(),
            contributing_strategies: Vec::new(),
            sizing_hint,
            snapshot_version: None,
        }
    }

    #[test]
    fn buy_respects_position_fraction() {
        let mut broker = PaperBroker::new(50_000.0);
        let report = broker.submit(&decision(Action::Buy, 1.0), 100.0).unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.quantity, 50.0);
        assert!((broker.cash() - 45_000.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_hint_scales_order() {
        let mut broker = PaperBroker::new(50_000.0);
        let report = broker.submit(&decision(Action::Buy, 0.5), 100.0).unwrap();
        assert_eq!(report.quantity, 25.0);
    }

    #[test]
    fn second_buy_hits_position_limit() {
        let mut broker = PaperBroker::new(50_000.0);
        broker.submit(&decision(Action::Buy, 1.0), 100.0).unwrap();
        assert!(matches!(
            broker.submit(&decision(Action::Buy, 1.0), 100.0),
            Err(ExecutionError::PositionLimit { .. })
        ));
    }

    #[test]
    fn liquidity_floor_blocks_buy() {
        let mut broker = PaperBroker::new(16_000.0);
        let err = broker.submit(&decision(Action::Buy, 1.0), 10.0).unwrap_err();
        assert!(matches!(err, ExecutionError::InsufficientLiquidity { .. }));
        assert_eq!(broker.cash(), 16_000.0);
    }

    #[test]
    fn sell_closes_position() {
        let mut broker = PaperBroker::new(50_000.0);
        broker.submit(&decision(Action::Buy, 1.0), 100.0).unwrap();
        let report = broker.submit(&decision(Action::Sell, 0.8), 110.0).unwrap();
        assert_eq!(report.quantity, 50.0);
        assert_eq!(broker.position("AAPL"), 0.0);
        assert!((broker.cash() - 50_500.0).abs() < 1e-9);
    }

    #[test]
    fn sell_without_position_errors() {
        let mut broker = PaperBroker::new(50_000.0);
        assert!(matches!(
            broker.submit(&decision(Action::Sell, 1.0), 100.0),
            Err(ExecutionError::NoPosition(_))
        ));
    }

    #[test]
    fn hold_places_no_order() {
        let mut broker = PaperBroker::new(50_000.0);
        let report = broker.submit(&decision(Action::Hold, 0.0), 100.0).unwrap();
        assert_eq!(report.status, OrderStatus::NoOrder);
        assert_eq!(broker.cash(), 50_000.0);
    }

    #[test]
    fn rejects_bad_price() {
        let mut broker = PaperBroker::new(50_000.0);
        assert!(broker.submit(&decision(Action::Buy, 1.0), f64::NAN).is_err());
    }
}
