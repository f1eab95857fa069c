//! In-memory cache of derived results
//!
//! Valuations are recomputed only when something they depend on changed.
//! An entry is valid for exactly one [`DerivationKey`]: the cluster
//! version, the comparable-set epoch of its city and the configuration
//! generation. The latest entry per cluster is also what a new result is
//! compared against before it is published.

use crate::fraud::{FraudSignal, RiskTier};
use crate::types::ClusterId;
use crate::valuation::ValuationResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a derived result depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationKey {
    pub version: u64,
    /// Bumped whenever any cluster in the city changed
    pub city_epoch: u64,
    pub config_generation: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    /// None for results loaded from storage, which are never a hit
    key: Option<DerivationKey>,
    value: T,
}

#[derive(Debug, Clone, Default)]
pub struct DerivedCache {
    valuations: Arc<RwLock<HashMap<ClusterId, CacheEntry<ValuationResult>>>>,
    signals: Arc<RwLock<HashMap<ClusterId, CacheEntry<FraudSignal>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub valuations: usize,
    pub signals: usize,
}

impl DerivedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached valuation, only if computed under the same key
    pub fn valuation(&self, id: ClusterId, key: &DerivationKey) -> Option<ValuationResult> {
        let cache = self.valuations.read();
        cache
            .get(&id)
            .filter(|entry| entry.key == Some(*key))
            .map(|entry| entry.value.clone())
    }

    pub fn put_valuation(&self, key: DerivationKey, value: ValuationResult) {
        self.valuations.write().insert(value.cluster_id, CacheEntry { key: Some(key), value });
    }

    /// Cached fraud signal, only if computed under the same key
    pub fn signal(&self, id: ClusterId, key: &DerivationKey) -> Option<FraudSignal> {
        let cache = self.signals.read();
        cache
            .get(&id)
            .filter(|entry| entry.key == Some(*key))
            .map(|entry| entry.value.clone())
    }

    pub fn put_signal(&self, key: DerivationKey, value: FraudSignal) {
        self.signals.write().insert(value.cluster_id, CacheEntry { key: Some(key), value });
    }

    /// Remember results published by an earlier run. They are compared
    /// against and keep their risk tier, but are always recomputed.
    pub fn seed(&self, valuations: Vec<ValuationResult>, signals: Vec<FraudSignal>) {
        let mut cache = self.valuations.write();
        for value in valuations {
            cache.insert(value.cluster_id, CacheEntry { key: None, value });
        }
        drop(cache);

        let mut cache = self.signals.write();
        for value in signals {
            cache.insert(value.cluster_id, CacheEntry { key: None, value });
        }
    }

    /// Most recent valuation for a cluster, whatever its key
    pub fn latest_valuation(&self, id: ClusterId) -> Option<ValuationResult> {
        self.valuations.read().get(&id).map(|entry| entry.value.clone())
    }

    pub fn latest_signal(&self, id: ClusterId) -> Option<FraudSignal> {
        self.signals.read().get(&id).map(|entry| entry.value.clone())
    }

    /// Tier of the most recent signal for a cluster, whatever its key
    pub fn last_tier(&self, id: ClusterId) -> Option<RiskTier> {
        self.signals.read().get(&id).map(|entry| entry.value.tier)
    }

    pub fn invalidate(&self, id: ClusterId) {
        self.valuations.write().remove(&id);
        self.signals.write().remove(&id);
    }

    pub fn clear(&self) {
        self.valuations.write().clear();
        self.signals.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            valuations: self.valuations.read().len(),
            signals: self.signals.read().len(),
        }
    }
}
