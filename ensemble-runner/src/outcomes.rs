//! Outcome realization over a fixed holding horizon.
//!
//! A signal (or an ensemble decision) taken at tick `t` at price `p_t` is
//! judged at tick `t + horizon` against that tick's price. Entries are kept
//! in arrival order, so realized items come out in the order they were
//! queued, which keeps each strategy's samples time-ordered.

use std::collections::VecDeque;

use ensemble_core::domain::{Action, EnsembleDecision, OutcomeSample, Signal, Symbol};

#[derive(Debug, Clone)]
struct Pending<T> {
    item: T,
    instrument: Symbol,
    entry_price: f64,
    due_tick: usize,
}

/// An item whose holding period has elapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Realized<T> {
    pub item: T,
    pub entry_price: f64,
    pub exit_price: f64,
}

#[derive(Debug, Clone)]
pub struct HorizonBook<T> {
    horizon: usize,
    pending: VecDeque<Pending<T>>,
}

impl<T> HorizonBook<T> {
    pub fn new(horizon: usize) -> Self {
        Self {
            horizon: horizon.max(1),
            pending: VecDeque::new(),
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn queue(&mut self, item: T, instrument: impl Into<Symbol>, entry_price: f64, tick: usize) {
        self.pending.push_back(Pending {
            item,
            instrument: instrument.into(),
            entry_price,
            due_tick: tick + self.horizon,
        });
    }

    /// Pop every entry due at or before `tick`. Entries whose exit price is
    /// unavailable are dropped.
    pub fn realize_due(&mut self, tick: usize, price: impl Fn(&str) -> Option<f64>) -> Vec<Realized<T>> {
        let mut realized = Vec::new();
        while self.pending.front().is_some_and(|p| p.due_tick <= tick) {
            let Some(p) = self.pending.pop_front() else {
                break;
            };
            if let Some(exit_price) = price(&p.instrument) {
                realized.push(Realized {
                    item: p.item,
                    entry_price: p.entry_price,
                    exit_price,
                });
            }
        }
        realized
    }
}

/// Book of strategy signals awaiting their outcome.
pub type OutcomeBook = HorizonBook<Signal>;

impl OutcomeBook {
    /// Queue a signal; HOLD signals risk nothing and are not tracked.
    pub fn queue_signal(&mut self, signal: Signal, entry_price: f64, tick: usize) {
        if signal.action == Action::Hold {
            return;
        }
        let instrument = signal.instrument.clone();
        self.queue(signal, instrument, entry_price, tick);
    }

    pub fn realize_samples(&mut self, tick: usize, price: impl Fn(&str) -> Option<f64>) -> Vec<OutcomeSample> {
        self.realize_due(tick, price)
            .into_iter()
            .filter_map(|r| OutcomeSample::realize(&r.item, r.entry_price, r.exit_price))
            .collect()
    }
}

/// Direction-adjusted return of an acted-on ensemble decision.
pub fn decision_return(realized: &Realized<EnsembleDecision>) -> Option<f64> {
    if realized.entry_price <= 0.0 || !realized.exit_price.is_finite() {
        return None;
    }
    Some((realized.exit_price / realized.entry_price - 1.0) * realized.item.action.direction())
}
