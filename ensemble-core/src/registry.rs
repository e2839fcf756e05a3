//! Strategy registry: the set of strategies the engine knows about.
//!
//! The registered id set is what snapshot validation checks weights against.
//! Disabled strategies stay registered (they keep their ranking entry) but are
//! not asked for signals.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::config::StrategyEntry;
use crate::domain::StrategyId;
use crate::source::{create_source, FactoryError, SignalSource};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("strategy '{0}' is already registered")]
    Duplicate(StrategyId),
    #[error("strategy '{0}' is not registered")]
    Unknown(StrategyId),
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

struct Registered {
    source: Arc<dyn SignalSource>,
    enabled: bool,
}

#[derive(Default)]
pub struct StrategyRegistry {
    entries: BTreeMap<StrategyId, Registered>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, r)| (id, (r.source.kind(), r.enabled))))
            .finish()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured strategy through the factory.
    pub fn from_config(entries: &[StrategyEntry]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in entries {
            let source: Arc<dyn SignalSource> = Arc::from(create_source(entry)?);
            registry.register(source, entry.enabled)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn SignalSource>, enabled: bool) -> Result<(), RegistryError> {
        let id = source.id().clone();
        if self.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.entries.insert(id, Registered { source, enabled });
        Ok(())
    }

    pub fn enable(&mut self, id: &StrategyId) -> Result<(), RegistryError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&mut self, id: &StrategyId) -> Result<(), RegistryError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: &StrategyId, enabled: bool) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn contains(&self, id: &StrategyId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_enabled(&self, id: &StrategyId) -> bool {
        self.entries.get(id).is_some_and(|r| r.enabled)
    }

    /// Every registered id, enabled or not.
    pub fn ids(&self) -> BTreeSet<StrategyId> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, id: &StrategyId) -> Option<Arc<dyn SignalSource>> {
        self.entries.get(id).map(|r| Arc::clone(&r.source))
    }

    pub fn enabled_ids(&self) -> BTreeSet<StrategyId> {
        self.entries
            .iter()
            .filter(|(_, r)| r.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sources to poll this tick, in id order.
    pub fn enabled(&self) -> Vec<Arc<dyn SignalSource>> {
        self.entries
            .values()
            .filter(|r| r.enabled)
            .map(|r| Arc::clone(&r.source))
            .collect()
    }

    /// Longest warmup among enabled sources.
    pub fn max_warmup(&self) -> usize {
        self.entries
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.source.warmup_bars())
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
