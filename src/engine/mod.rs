//! Batch pipeline
//!
//! One pass over a batch of raw listings:
//! 1. Normalize, quarantining records that cannot be projected
//! 2. Move listings whose locality changed out of their old partition
//! 3. Per partition, under its lock and in parallel with the others:
//!    retry held listings, resolve, record prices, consolidate, reconcile
//! 4. Value and score every live cluster from version-checked snapshots,
//!    publishing only results that differ from the last ones, and emit events
//!
//! Listings are sorted by (scraped_at, key) before resolution, so the
//! order a batch arrives in never changes the outcome.

pub mod queue;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use queue::{load_listings, parse_listings, InboxSource, IngestQueue, ListingSource};
pub use scheduler::{PassReport, Scheduler};

use crate::config::ConfigSnapshot;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventPayload, HighRiskPayload, QuarantinedPayload};
use crate::fraud::{FraudScorer, FraudSignal, MarketIndex, RiskTier};
use crate::normalize::{Normalizer, Rejection};
use crate::pricing::PriceReconciler;
use crate::resolve::{ClusterStore, Resolution, Resolver, SplitOutcome};
use crate::storage::cache::{DerivationKey, DerivedCache};
use crate::types::{CanonicalProperty, ClusterId, ListingKey, NormalizedListing, PartitionKey, PriceObservation, RawListing};
use crate::valuation::{ValuationModel, ValuationResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Optimistic derivation attempts before a result is dropped
const DERIVATION_ATTEMPTS: usize = 3;

/// Everything one pass publishes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutput {
    pub batch_id: String,
    pub as_of: DateTime<Utc>,
    pub config_generation: u64,
    /// Clusters whose content changed this pass, tombstones included
    pub properties: Vec<CanonicalProperty>,
    pub valuations: Vec<ValuationResult>,
    pub fraud_signals: Vec<FraudSignal>,
    pub quarantined: Vec<Rejection>,
    /// Listings held as ambiguous, retried next pass
    pub unresolved: Vec<ListingKey>,
    pub events: Vec<Event>,
    /// Clusters whose derived results kept losing the version race
    pub discarded: Vec<ClusterId>,
}

impl BatchOutput {
    pub fn property(&self, id: ClusterId) -> Option<&CanonicalProperty> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn valuation(&self, id: ClusterId) -> Option<&ValuationResult> {
        self.valuations.iter().find(|v| v.cluster_id == id)
    }

    pub fn fraud_signal(&self, id: ClusterId) -> Option<&FraudSignal> {
        self.fraud_signals.iter().find(|s| s.cluster_id == id)
    }
}

/// What one partition worker did
#[derive(Debug, Default)]
struct PartitionReport {
    touched: BTreeSet<ClusterId>,
    events: Vec<EventPayload>,
    failures: usize,
}

/// Long-lived engine state: the cluster arena and the derived-result cache
#[derive(Default)]
pub struct Engine {
    store: ClusterStore,
    cache: DerivedCache,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn cache(&self) -> &DerivedCache {
        &self.cache
    }

    /// Pick up where an earlier run stopped: its clusters, and its last
    /// published results so unchanged ones are not published again and
    /// high-risk clusters do not re-enter the tier.
    pub fn restore(
        &self,
        properties: Vec<CanonicalProperty>,
        valuations: Vec<ValuationResult>,
        signals: Vec<FraudSignal>,
    ) -> usize {
        let restored = self.store.restore(properties);
        self.cache.seed(valuations, signals);
        restored
    }

    /// Detach a member into its own property on request
    pub fn split(
        &self,
        snapshot: &ConfigSnapshot,
        cluster_id: ClusterId,
        key: &ListingKey,
        now: DateTime<Utc>,
    ) -> Result<Option<SplitOutcome>> {
        let resolver = Resolver::new(&self.store, &snapshot.config.resolver);
        let outcome = resolver.split(cluster_id, key, now)?;
        if let Some(split) = &outcome {
            self.cache.invalidate(split.source);
        }
        Ok(outcome)
    }

    /// Run one pass over a batch
    pub fn process_batch(
        &self,
        snapshot: &ConfigSnapshot,
        batch: Vec<RawListing>,
        as_of: DateTime<Utc>,
    ) -> Result<BatchOutput> {
        let config = &snapshot.config;
        let batch_id = Uuid::new_v4().to_string();
        info!("Batch {}: {} raw listings", batch_id, batch.len());

        self.store.begin_pass(as_of);

        let normalizer = Normalizer::new(config.normalizer.clone());
        let (listings, quarantined) = normalizer.normalize_batch(&batch, as_of);
        let listings = order_listings(listings);

        let resolver = Resolver::new(&self.store, &config.resolver);
        let pricing = PriceReconciler::new(config.pricing.clone());

        // Listings that changed locality leave their old partition first,
        // while no partition lock is held.
        let mut touched: BTreeSet<ClusterId> = BTreeSet::new();
        let mut carried: HashMap<ListingKey, Vec<PriceObservation>> = HashMap::new();
        for listing in &listings {
            if let Some(evicted) = resolver.evict_if_moved(&listing.key, &listing.partition_key(), listing.scraped_at) {
                touched.insert(evicted.cluster_id);
                carried.insert(listing.key.clone(), evicted.observations);
            }
        }

        let mut groups: BTreeMap<PartitionKey, Vec<NormalizedListing>> = BTreeMap::new();
        for key in self.store.partition_keys() {
            groups.entry(key).or_default();
        }
        for listing in listings {
            groups.entry(listing.partition_key()).or_default().push(listing);
        }
        let work: Vec<(PartitionKey, Vec<NormalizedListing>, HashMap<ListingKey, Vec<PriceObservation>>)> = groups
            .into_iter()
            .map(|(key, listings)| {
                let carried_here = listings
                    .iter()
                    .filter_map(|l| carried.remove_entry(&l.key))
                    .collect();
                (key, listings, carried_here)
            })
            .collect();

        let reports: Vec<(PartitionKey, PartitionReport)> = std::thread::scope(|scope| {
            let handles: Vec<_> = work
                .into_iter()
                .map(|(key, listings, carried)| {
                    let resolver = &resolver;
                    let pricing = &pricing;
                    let store = &self.store;
                    scope.spawn(move || {
                        let report = process_partition(store, resolver, pricing, &key, listings, carried, as_of);
                        (key, report)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| EngineError::Internal("partition worker panicked".to_string())))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut payloads = Vec::new();
        let mut failures = 0;
        let mut changed_cities: BTreeSet<String> = BTreeSet::new();
        for (key, report) in reports {
            if !report.touched.is_empty() {
                changed_cities.insert(key.city.clone());
            }
            touched.extend(report.touched);
            payloads.extend(report.events);
            failures += report.failures;
        }
        for city in &changed_cities {
            self.store.bump_city_epoch(city);
        }

        let mut properties: Vec<CanonicalProperty> = touched.iter().filter_map(|id| self.store.get(*id)).collect();
        properties.sort_by_key(|p| p.id);

        let derived = self.derive(snapshot, as_of);
        payloads.extend(derived.events);

        let mut events: Vec<Event> = quarantined
            .iter()
            .map(|r| Event::new("normalizer", EventPayload::Quarantined(QuarantinedPayload::from(r))))
            .chain(payloads.into_iter().map(|p| Event::new("engine", p)))
            .map(|e| e.at(as_of).with_correlation_id(&batch_id))
            .collect();
        events.sort_by_key(|e| (e.kind() as u8, e.cluster_id()));

        let output = BatchOutput {
            batch_id,
            as_of,
            config_generation: snapshot.generation,
            properties,
            valuations: derived.valuations,
            fraud_signals: derived.signals,
            quarantined,
            unresolved: self.store.unresolved(),
            events,
            discarded: derived.discarded,
        };

        info!(
            "Batch {} done: {} properties changed, {} valuations, {} fraud signals, {} quarantined, {} unresolved, {} failed",
            output.batch_id,
            output.properties.len(),
            output.valuations.len(),
            output.fraud_signals.len(),
            output.quarantined.len(),
            output.unresolved.len(),
            failures
        );
        Ok(output)
    }

    /// Value and score every live cluster from per-city snapshots.
    ///
    /// Valuations come from the cache while their [`DerivationKey`] holds.
    /// Fraud signals are rescored every pass because some rules depend on
    /// the clock. Only results that differ from the previous ones are
    /// published.
    ///
    /// A result is kept only if the cluster version and the city epoch it
    /// was computed from are still current afterwards; otherwise the city
    /// is re-read, up to [`DERIVATION_ATTEMPTS`] times.
    fn derive(&self, snapshot: &ConfigSnapshot, as_of: DateTime<Utc>) -> Derived {
        let config = &snapshot.config;
        let model = ValuationModel::new(config.valuation.clone());
        let scorer = FraudScorer::new(config.fraud.clone());
        let mut derived = Derived::default();

        let cities: BTreeSet<String> = self.store.partition_keys().into_iter().map(|k| k.city).collect();
        for city in &cities {
            // None until the first attempt, then the ids that lost the race
            let mut pending: Option<BTreeSet<ClusterId>> = None;
            for attempt in 1..=DERIVATION_ATTEMPTS {
                let epoch = self.store.city_epoch(city);
                let market_snapshot = self.store.city_snapshot(city);
                let market = MarketIndex::build(&market_snapshot);

                let computed: Vec<Derivation> = market_snapshot
                    .iter()
                    .filter(|c| !c.is_merged() && !c.members.is_empty())
                    .filter(|c| pending.as_ref().map_or(true, |ids| ids.contains(&c.id)))
                    .map(|cluster| {
                        let key = DerivationKey {
                            version: cluster.version,
                            city_epoch: epoch,
                            config_generation: snapshot.generation,
                        };
                        let cached = self.cache.valuation(cluster.id, &key);
                        let fresh_valuation = cached.is_none();
                        let valuation = cached.unwrap_or_else(|| model.value(cluster, &market_snapshot, as_of));
                        let signal = self
                            .cache
                            .signal(cluster.id, &key)
                            .filter(|s| s.computed_at == as_of)
                            .unwrap_or_else(|| scorer.score(cluster, Some(&valuation), &market, as_of));
                        Derivation {
                            key,
                            valuation,
                            fresh_valuation,
                            signal,
                        }
                    })
                    .collect();

                let epoch_moved = self.store.city_epoch(city) != epoch;
                let mut conflicts = BTreeSet::new();
                for derivation in computed {
                    let id = derivation.valuation.cluster_id;
                    let current = self.store.version_of(id);
                    if epoch_moved || current != Some(derivation.key.version) {
                        let err = EngineError::StaleVersionConflict {
                            cluster_id: id,
                            expected: derivation.key.version,
                            found: current.unwrap_or(0),
                        };
                        debug!("Attempt {}: {}", attempt, err);
                        conflicts.insert(id);
                        continue;
                    }
                    self.accept(&mut derived, derivation);
                }

                if conflicts.is_empty() {
                    pending = None;
                    break;
                }
                pending = Some(conflicts);
            }

            for id in pending.into_iter().flatten() {
                warn!("Discarding derived results for {} after {} attempts", id, DERIVATION_ATTEMPTS);
                derived.discarded.push(id);
            }
        }

        derived.valuations.sort_by_key(|v| v.cluster_id);
        derived.signals.sort_by_key(|s| s.cluster_id);
        derived
    }

    fn accept(&self, derived: &mut Derived, derivation: Derivation) {
        let Derivation {
            key,
            valuation,
            fresh_valuation,
            signal,
        } = derivation;
        let id = signal.cluster_id;

        let previous_tier = self.cache.last_tier(id);
        if signal.tier == RiskTier::High && previous_tier != Some(RiskTier::High) {
            info!("{} rated high risk (score {})", id, signal.score);
            derived.events.push(EventPayload::HighRisk(HighRiskPayload {
                cluster_id: id,
                version: signal.version,
                score: signal.score,
                rules: signal.triggered.iter().map(|t| t.rule).collect(),
                previous_tier,
            }));
        }

        let valuation_changed = fresh_valuation
            && !self
                .cache
                .latest_valuation(id)
                .is_some_and(|previous| previous.same_outcome(&valuation));
        let signal_changed = !self
            .cache
            .latest_signal(id)
            .is_some_and(|previous| previous.same_outcome(&signal));

        self.cache.put_valuation(key, valuation.clone());
        self.cache.put_signal(key, signal.clone());
        if valuation_changed {
            derived.valuations.push(valuation);
        }
        if signal_changed {
            derived.signals.push(signal);
        }
    }
}

/// One cluster's results before the version check
struct Derivation {
    key: DerivationKey,
    valuation: ValuationResult,
    /// Computed this pass rather than read from the cache
    fresh_valuation: bool,
    signal: FraudSignal,
}

#[derive(Default)]
struct Derived {
    valuations: Vec<ValuationResult>,
    signals: Vec<FraudSignal>,
    events: Vec<EventPayload>,
    discarded: Vec<ClusterId>,
}

/// Sort by (scraped_at, key, fingerprint) and keep, per key, only the
/// versions in the locality of its latest version.
fn order_listings(mut listings: Vec<NormalizedListing>) -> Vec<NormalizedListing> {
    listings.sort_by(|a, b| {
        (a.scraped_at, &a.key, &a.fingerprint).cmp(&(b.scraped_at, &b.key, &b.fingerprint))
    });
    // Identical scrapes of one key at one instant collapse to the first.
    // Later scrapes with an unchanged fingerprint stay, so update_member
    // still advances last_confirmed.
    listings.dedup_by(|b, a| a.key == b.key && a.fingerprint == b.fingerprint && a.scraped_at == b.scraped_at);

    let latest: HashMap<ListingKey, PartitionKey> = listings
        .iter()
        .map(|l| (l.key.clone(), l.partition_key()))
        .collect();
    listings.retain(|l| {
        let keep = latest.get(&l.key) == Some(&l.partition_key());
        if !keep {
            debug!("{} superseded by a later version in another locality", l.key);
        }
        keep
    });
    listings
}

/// Resolve, price and reconcile one partition under its lock
fn process_partition(
    store: &ClusterStore,
    resolver: &Resolver<'_>,
    pricing: &PriceReconciler,
    key: &PartitionKey,
    listings: Vec<NormalizedListing>,
    mut carried: HashMap<ListingKey, Vec<PriceObservation>>,
    as_of: DateTime<Utc>,
) -> PartitionReport {
    let handle = store.partition(key);
    let mut partition = handle.lock();
    let mut report = PartitionReport::default();

    let versions_before: HashMap<ClusterId, u64> = partition.clusters().map(|c| (c.id, c.version)).collect();

    let held_prices: HashMap<ListingKey, (Decimal, DateTime<Utc>)> = partition
        .held
        .values()
        .map(|h| (h.listing.key.clone(), (h.listing.price_eur, h.listing.scraped_at)))
        .collect();
    for (listing_key, outcome) in resolver.retry_held(&mut partition) {
        if let Some(&(price, at)) = held_prices.get(&listing_key) {
            record_outcome(&mut partition, pricing, &mut report, &listing_key, price, at, outcome);
        }
    }

    for listing in listings {
        let listing_key = listing.key.clone();
        let (price, at) = (listing.price_eur, listing.scraped_at);
        let observations = carried.remove(&listing_key).unwrap_or_default();
        let outcome = resolver.resolve_in(&mut partition, listing, observations);
        record_outcome(&mut partition, pricing, &mut report, &listing_key, price, at, outcome);
    }

    for merge in resolver.consolidate_in(&mut partition, as_of) {
        report.events.push(EventPayload::ClusterMerged(merge));
    }

    for cluster in partition.clusters_mut() {
        let reconciled = pricing.reconcile(cluster, as_of);
        if let Some(delta) = reconciled.delta {
            report.events.push(EventPayload::PriceDelta(delta));
        }
    }

    report.touched = partition
        .clusters()
        .filter(|c| versions_before.get(&c.id) != Some(&c.version))
        .map(|c| c.id)
        .collect();

    debug!("Partition {}: {} clusters changed", key, report.touched.len());
    report
}

fn record_outcome(
    partition: &mut crate::resolve::Partition,
    pricing: &PriceReconciler,
    report: &mut PartitionReport,
    key: &ListingKey,
    price: Decimal,
    at: DateTime<Utc>,
    outcome: Result<Resolution>,
) {
    match outcome {
        Ok(resolution) => {
            if let Resolution::Updated {
                cluster_id,
                split_off: Some(new_cluster),
            } = resolution
            {
                let moved_observations = partition.cluster(new_cluster).map(|c| c.price_history.len()).unwrap_or(0);
                report.events.push(EventPayload::ClusterSplit(SplitOutcome {
                    source: cluster_id,
                    detached: key.clone(),
                    new_cluster,
                    moved_observations,
                }));
            }
            if let Some(cluster) = partition.cluster_mut(resolution.home()) {
                // A late, older scrape can still add history
                if pricing.observe(cluster, key, price, at) && matches!(resolution, Resolution::Unchanged(_)) {
                    cluster.bump_version(at);
                }
            }
        }
        Err(EngineError::AmbiguousMatch { candidates, .. }) => {
            debug!("{} held, candidates {:?}", key, candidates);
        }
        Err(e) => {
            warn!("Failed to resolve {}: {}", key, e);
            report.failures += 1;
        }
    }
}
