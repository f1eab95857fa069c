//! Cluster arena partitioned by (city, neighborhood)
//!
//! Each partition sits behind its own mutex so resolution decisions and
//! the writes they imply happen atomically per locality while different
//! localities proceed in parallel. Global lookup tables are kept in
//! `RwLock`s and are only touched briefly, never while another partition
//! lock is being acquired.

use crate::types::{CanonicalProperty, ClusterId, ListingKey, NormalizedListing, PartitionKey, PriceObservation};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A listing whose resolution was deferred, retried on the next pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldListing {
    pub listing: NormalizedListing,
    /// Observations carried over from a partition the listing left
    pub carried: Vec<PriceObservation>,
    pub candidates: Vec<ClusterId>,
}

/// Clusters of one locality
#[derive(Debug, Default)]
pub struct Partition {
    pub(crate) clusters: BTreeMap<ClusterId, CanonicalProperty>,
    pub(crate) index: HashMap<ListingKey, ClusterId>,
    pub(crate) held: BTreeMap<ListingKey, HeldListing>,
    /// Cluster pairs separated by a split; consolidation never rejoins them
    pub(crate) separated: BTreeSet<(ClusterId, ClusterId)>,
}

impl Partition {
    pub fn cluster(&self, id: ClusterId) -> Option<&CanonicalProperty> {
        self.clusters.get(&id)
    }

    pub fn cluster_mut(&mut self, id: ClusterId) -> Option<&mut CanonicalProperty> {
        self.clusters.get_mut(&id)
    }

    pub fn cluster_of(&self, key: &ListingKey) -> Option<ClusterId> {
        self.index.get(key).copied()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &CanonicalProperty> {
        self.clusters.values()
    }

    pub fn clusters_mut(&mut self) -> impl Iterator<Item = &mut CanonicalProperty> {
        self.clusters.values_mut()
    }

    pub fn held_keys(&self) -> Vec<ListingKey> {
        self.held.keys().cloned().collect()
    }

    /// Remove every held listing for a retry
    pub fn take_held(&mut self) -> Vec<HeldListing> {
        std::mem::take(&mut self.held).into_values().collect()
    }

    pub(crate) fn mark_separated(&mut self, a: ClusterId, b: ClusterId) {
        self.separated.insert((a.min(b), a.max(b)));
    }

    pub(crate) fn is_separated(&self, a: ClusterId, b: ClusterId) -> bool {
        self.separated.contains(&(a.min(b), a.max(b)))
    }
}

/// Monotonic cluster id source; ids are never reused
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    pub fn next(&self) -> ClusterId {
        ClusterId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Make sure `id` is never handed out again
    pub fn advance_past(&self, id: ClusterId) {
        self.next.fetch_max(id.0.saturating_add(1), Ordering::SeqCst);
    }
}

/// All clusters known to the engine
pub struct ClusterStore {
    partitions: RwLock<BTreeMap<PartitionKey, Arc<Mutex<Partition>>>>,
    locations: RwLock<HashMap<ListingKey, PartitionKey>>,
    cluster_partitions: RwLock<HashMap<ClusterId, PartitionKey>>,
    /// Bumped whenever any cluster in the city changes
    city_epochs: RwLock<HashMap<String, u64>>,
    ids: IdAllocator,
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            locations: RwLock::new(HashMap::new()),
            cluster_partitions: RwLock::new(HashMap::new()),
            city_epochs: RwLock::new(HashMap::new()),
            ids: IdAllocator::new(1),
        }
    }

    /// Partition handle, created on first use
    pub fn partition(&self, key: &PartitionKey) -> Arc<Mutex<Partition>> {
        if let Some(partition) = self.partitions.read().get(key) {
            return Arc::clone(partition);
        }
        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(key.clone()).or_default())
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.partitions.read().keys().cloned().collect()
    }

    pub fn next_id(&self) -> ClusterId {
        self.ids.next()
    }

    /// Partition currently holding a listing key
    pub fn locate(&self, key: &ListingKey) -> Option<PartitionKey> {
        self.locations.read().get(key).cloned()
    }

    pub(crate) fn record_location(&self, key: &ListingKey, partition: &PartitionKey) {
        self.locations.write().insert(key.clone(), partition.clone());
    }

    pub(crate) fn forget_location(&self, key: &ListingKey) {
        self.locations.write().remove(key);
    }

    pub(crate) fn record_cluster(&self, id: ClusterId, partition: &PartitionKey) {
        self.cluster_partitions.write().insert(id, partition.clone());
    }

    pub(crate) fn forget_cluster(&self, id: ClusterId) {
        self.cluster_partitions.write().remove(&id);
    }

    pub fn cluster_partition(&self, id: ClusterId) -> Option<PartitionKey> {
        self.cluster_partitions.read().get(&id).cloned()
    }

    /// Clone of one cluster
    pub fn get(&self, id: ClusterId) -> Option<CanonicalProperty> {
        let key = self.cluster_partition(id)?;
        let partition = self.partition(&key);
        let guard = partition.lock();
        guard.cluster(id).cloned()
    }

    /// Current version of a cluster, if it exists
    pub fn version_of(&self, id: ClusterId) -> Option<u64> {
        let key = self.cluster_partition(id)?;
        let partition = self.partition(&key);
        let guard = partition.lock();
        guard.cluster(id).map(|c| c.version)
    }

    /// Clones of every cluster in a city, tombstones included
    pub fn city_snapshot(&self, city: &str) -> Vec<CanonicalProperty> {
        let handles: Vec<_> = self
            .partitions
            .read()
            .iter()
            .filter(|(key, _)| key.city == city)
            .map(|(_, p)| Arc::clone(p))
            .collect();

        let mut clusters = Vec::new();
        for handle in handles {
            clusters.extend(handle.lock().clusters().cloned());
        }
        clusters.sort_by_key(|c| c.id);
        clusters
    }

    /// Clones of every cluster
    pub fn all(&self) -> Vec<CanonicalProperty> {
        let handles: Vec<_> = self.partitions.read().values().cloned().collect();
        let mut clusters = Vec::new();
        for handle in handles {
            clusters.extend(handle.lock().clusters().cloned());
        }
        clusters.sort_by_key(|c| c.id);
        clusters
    }

    /// Keys waiting for a non-ambiguous resolution
    pub fn unresolved(&self) -> Vec<ListingKey> {
        let handles: Vec<_> = self.partitions.read().values().cloned().collect();
        let mut keys: Vec<ListingKey> = handles.iter().flat_map(|h| h.lock().held_keys()).collect();
        keys.sort();
        keys
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_partitions.read().len()
    }

    pub fn city_epoch(&self, city: &str) -> u64 {
        self.city_epochs.read().get(city).copied().unwrap_or(0)
    }

    pub fn bump_city_epoch(&self, city: &str) -> u64 {
        let mut epochs = self.city_epochs.write();
        let epoch = epochs.entry(city.to_string()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    /// Load clusters persisted by an earlier run.
    ///
    /// Where two stored clusters claim one listing, the more recently
    /// updated one keeps it; a cluster left without members is dropped
    /// unless it is a merge tombstone. New ids continue after the highest
    /// stored id, dropped clusters included. Returns how many clusters
    /// were loaded.
    pub fn restore(&self, mut properties: Vec<CanonicalProperty>) -> usize {
        properties.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.version.cmp(&a.version))
                .then(a.id.cmp(&b.id))
        });

        let mut cities = BTreeSet::new();
        let mut restored = 0;
        for mut property in properties {
            self.ids.advance_past(property.id);
            if self.cluster_partition(property.id).is_some() {
                continue;
            }

            let claimed: Vec<ListingKey> = property
                .members
                .keys()
                .filter(|key| self.locate(key).is_some())
                .cloned()
                .collect();
            if !claimed.is_empty() {
                for key in &claimed {
                    property.members.remove(key);
                }
                property.price_history.retain(|o| !claimed.contains(&o.key));
                if property.members.is_empty() {
                    debug!("{} not restored, all members moved on", property.id);
                    continue;
                }
                property.recompute_representative();
            }

            let partition_key = property.partition.clone();
            let handle = self.partition(&partition_key);
            let mut partition = handle.lock();
            for key in property.members.keys() {
                partition.index.insert(key.clone(), property.id);
                self.record_location(key, &partition_key);
            }
            self.record_cluster(property.id, &partition_key);
            cities.insert(partition_key.city.clone());
            partition.clusters.insert(property.id, property);
            restored += 1;
        }

        for city in &cities {
            self.bump_city_epoch(city);
        }
        info!("Restored {} clusters in {} cities", restored, cities.len());
        restored
    }

    /// Clear last pass's split marks. Marks do not count as a change, so
    /// versions are left alone.
    pub fn begin_pass(&self, now: DateTime<Utc>) {
        let handles: Vec<_> = self.partitions.read().values().cloned().collect();
        for handle in handles {
            let mut partition = handle.lock();
            for cluster in partition.clusters_mut() {
                if cluster.status == crate::types::ClusterStatus::Split {
                    cluster.status = crate::types::ClusterStatus::Active;
                    cluster.updated_at = cluster.updated_at.max(now);
                }
            }
        }
    }
}
