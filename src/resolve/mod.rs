//! Identity resolution
//!
//! Decides which normalized listings denote the same physical unit and
//! maintains the resulting clusters:
//! - Pre-filter by partition, area band, room count and source exclusivity
//! - Weighted similarity against each candidate's representative
//! - Merge above the threshold, hold ambiguous matches, otherwise create
//! - In-place updates, contradiction splits and explicit splits
//! - Consolidation of clusters that turn out to describe one unit

pub mod similarity;
pub mod store;

#[cfg(test)]
mod tests;

pub use similarity::{MatchProfile, SimilarityBreakdown};
pub use store::{ClusterStore, HeldListing, IdAllocator, Partition};

use crate::config::ResolverConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    CanonicalProperty, ClusterId, ClusterStatus, LegalStatus, ListingKey, MemberRecord, NormalizedListing,
    PartitionKey, PriceObservation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Outcome of resolving one listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// New singleton cluster
    Created(ClusterId),
    /// Joined an existing cluster
    Joined(ClusterId),
    /// Known key with changed content. `split_off` is set when the update
    /// contradicted the other members and the listing was detached.
    Updated {
        cluster_id: ClusterId,
        split_off: Option<ClusterId>,
    },
    /// Identical re-submission; only the confirmation time moved
    Unchanged(ClusterId),
}

impl Resolution {
    /// Cluster the listing belongs to after resolution
    pub fn home(&self) -> ClusterId {
        match *self {
            Resolution::Created(id) | Resolution::Joined(id) | Resolution::Unchanged(id) => id,
            Resolution::Updated { cluster_id, split_off } => split_off.unwrap_or(cluster_id),
        }
    }

    /// Clusters whose membership or content changed
    pub fn touched(&self) -> Vec<ClusterId> {
        match *self {
            Resolution::Created(id) | Resolution::Joined(id) => vec![id],
            Resolution::Updated { cluster_id, split_off } => {
                std::iter::once(cluster_id).chain(split_off).collect()
            }
            Resolution::Unchanged(_) => Vec::new(),
        }
    }
}

/// Result of a split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOutcome {
    pub source: ClusterId,
    pub detached: ListingKey,
    pub new_cluster: ClusterId,
    pub moved_observations: usize,
}

/// Result of absorbing one cluster into another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub survivor: ClusterId,
    pub absorbed: ClusterId,
    pub score: f64,
}

/// Listing removed from the partition it used to live in
#[derive(Debug, Clone)]
pub struct Evicted {
    pub from: PartitionKey,
    pub cluster_id: ClusterId,
    pub observations: Vec<PriceObservation>,
}

pub struct Resolver<'a> {
    store: &'a ClusterStore,
    config: &'a ResolverConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a ClusterStore, config: &'a ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Resolve one listing, locking its partition for the decision
    pub fn resolve(&self, listing: NormalizedListing) -> Result<Resolution> {
        let partition_key = listing.partition_key();
        let carried = self
            .evict_if_moved(&listing.key, &partition_key, listing.scraped_at)
            .map(|e| e.observations)
            .unwrap_or_default();

        let handle = self.store.partition(&partition_key);
        let mut partition = handle.lock();
        self.resolve_in(&mut partition, listing, carried)
    }

    /// Take a listing out of its old partition when its locality changed.
    ///
    /// Must be called without holding any partition lock.
    pub fn evict_if_moved(&self, key: &ListingKey, target: &PartitionKey, now: DateTime<Utc>) -> Option<Evicted> {
        let from = self.store.locate(key).filter(|p| p != target)?;
        let handle = self.store.partition(&from);
        let mut partition = handle.lock();

        // A held listing just moves with its new version
        if partition.held.remove(key).is_some() {
            self.store.forget_location(key);
            return None;
        }

        let cluster_id = partition.index.remove(key)?;
        let cluster = partition.clusters.get_mut(&cluster_id)?;
        cluster.members.remove(key);
        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut cluster.price_history)
            .into_iter()
            .partition(|o| &o.key == key);
        cluster.price_history = kept;

        if cluster.members.is_empty() {
            partition.clusters.remove(&cluster_id);
            self.store.forget_cluster(cluster_id);
        } else {
            cluster.recompute_representative();
            cluster.bump_version(now);
        }
        self.store.forget_location(key);
        self.store.bump_city_epoch(&from.city);

        info!("{} moved out of {} (cluster {})", key, from, cluster_id);
        Some(Evicted {
            from,
            cluster_id,
            observations: moved,
        })
    }

    /// Resolve one listing inside an already locked partition
    pub fn resolve_in(
        &self,
        partition: &mut Partition,
        listing: NormalizedListing,
        carried: Vec<PriceObservation>,
    ) -> Result<Resolution> {
        let partition_key = listing.partition_key();
        self.store.record_location(&listing.key, &partition_key);

        if let Some(cluster_id) = partition.cluster_of(&listing.key) {
            return self.update_member(partition, cluster_id, listing);
        }

        let ranked = self.rank_candidates(partition, &listing);
        if let Some(&(best_id, best_score)) = ranked.first() {
            if best_score >= self.config.merge_threshold {
                let runner_up = ranked
                    .get(1)
                    .filter(|(_, s)| *s >= self.config.merge_threshold && best_score - *s < self.config.ambiguity_margin);

                if let Some(&(second_id, second_score)) = runner_up {
                    debug!(
                        "{} ambiguous between {} ({:.3}) and {} ({:.3})",
                        listing.key, best_id, best_score, second_id, second_score
                    );
                    let candidates: Vec<ClusterId> = ranked
                        .iter()
                        .filter(|(_, s)| best_score - *s < self.config.ambiguity_margin)
                        .map(|(id, _)| *id)
                        .collect();
                    let key = listing.key.clone();
                    partition.held.insert(
                        key.clone(),
                        HeldListing {
                            listing,
                            carried,
                            candidates: candidates.clone(),
                        },
                    );
                    return Err(EngineError::AmbiguousMatch { key, candidates });
                }

                debug!("{} joins {} (score {:.3})", listing.key, best_id, best_score);
                return self.join(partition, best_id, listing, carried);
            }
        }

        let id = self.store.next_id();
        debug!("{} starts new cluster {}", listing.key, id);
        partition.held.remove(&listing.key);
        partition.index.insert(listing.key.clone(), id);
        let mut cluster = CanonicalProperty::singleton(id, listing);
        for observation in carried {
            cluster.insert_observation(observation);
        }
        partition.clusters.insert(id, cluster);
        self.store.record_cluster(id, &partition_key);
        Ok(Resolution::Created(id))
    }

    /// Candidates passing the pre-filter, best score first, ties by id
    fn rank_candidates(&self, partition: &Partition, listing: &NormalizedListing) -> Vec<(ClusterId, f64)> {
        let profile = MatchProfile::from(listing);
        let mut ranked: Vec<(ClusterId, f64)> = partition
            .clusters()
            .filter(|c| !c.is_merged() && !c.members.is_empty())
            .filter(|c| !c.has_source(&listing.key.source))
            .filter_map(|c| {
                let candidate = MatchProfile::from(&c.representative);
                if !similarity::passes_prefilter(&profile, &candidate, self.config) {
                    return None;
                }
                let breakdown = similarity::similarity(&profile, &candidate, self.config);
                Some((c.id, breakdown.score))
            })
            .collect();

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }

    fn join(
        &self,
        partition: &mut Partition,
        cluster_id: ClusterId,
        listing: NormalizedListing,
        carried: Vec<PriceObservation>,
    ) -> Result<Resolution> {
        let cluster = partition
            .clusters
            .get_mut(&cluster_id)
            .ok_or(EngineError::UnknownCluster(cluster_id))?;

        let key = listing.key.clone();
        let now = listing.scraped_at;
        cluster.members.insert(key.clone(), MemberRecord::new(listing));
        for observation in carried {
            cluster.insert_observation(observation);
        }
        cluster.recompute_representative();
        if cluster.status == ClusterStatus::Split {
            cluster.status = ClusterStatus::Active;
        }
        cluster.bump_version(now);

        partition.held.remove(&key);
        partition.index.insert(key, cluster_id);
        Ok(Resolution::Joined(cluster_id))
    }

    fn update_member(
        &self,
        partition: &mut Partition,
        cluster_id: ClusterId,
        listing: NormalizedListing,
    ) -> Result<Resolution> {
        let key = listing.key.clone();
        let cluster = partition
            .clusters
            .get_mut(&cluster_id)
            .ok_or(EngineError::UnknownCluster(cluster_id))?;
        let member = cluster.members.get_mut(&key).ok_or_else(|| EngineError::UnknownMember {
            cluster_id,
            key: key.clone(),
        })?;

        member.last_confirmed = member.last_confirmed.max(listing.scraped_at);

        // Same content, or an older scrape arriving late
        if member.listing.fingerprint == listing.fingerprint || listing.scraped_at < member.listing.scraped_at {
            return Ok(Resolution::Unchanged(cluster_id));
        }

        let now = listing.scraped_at;
        member.listing = listing;
        cluster.recompute_representative();
        if cluster.status == ClusterStatus::Split {
            cluster.status = ClusterStatus::Active;
        }
        cluster.bump_version(now);
        debug!("{} updated in place in {}", key, cluster_id);

        if self.contradicts_rest(cluster, &key) {
            info!("{} contradicts the rest of {}, splitting", key, cluster_id);
            let outcome = self.split_in(partition, cluster_id, &key, now)?;
            return Ok(Resolution::Updated {
                cluster_id,
                split_off: outcome.map(|o| o.new_cluster),
            });
        }

        Ok(Resolution::Updated {
            cluster_id,
            split_off: None,
        })
    }

    /// True when the member disagrees with every other member on location
    /// or on a known legal status
    fn contradicts_rest(&self, cluster: &CanonicalProperty, key: &ListingKey) -> bool {
        let Some(member) = cluster.members.get(key) else {
            return false;
        };
        let others: Vec<_> = cluster.members.values().filter(|m| &m.listing.key != key).collect();
        if others.is_empty() {
            return false;
        }

        others.iter().all(|other| {
            let far = match (member.listing.geo, other.listing.geo) {
                (Some(a), Some(b)) => a.distance_m(&b) > self.config.split_distance_m,
                _ => false,
            };
            let legal_conflict = member.listing.legal_status != LegalStatus::Unknown
                && other.listing.legal_status != LegalStatus::Unknown
                && member.listing.legal_status != other.listing.legal_status;
            far || legal_conflict
        })
    }

    /// Detach a member into its own cluster, locking the owning partition
    pub fn split(&self, cluster_id: ClusterId, key: &ListingKey, now: DateTime<Utc>) -> Result<Option<SplitOutcome>> {
        let partition_key = self
            .store
            .cluster_partition(cluster_id)
            .ok_or(EngineError::UnknownCluster(cluster_id))?;
        let handle = self.store.partition(&partition_key);
        let mut partition = handle.lock();
        let outcome = self.split_in(&mut partition, cluster_id, key, now)?;
        if outcome.is_some() {
            self.store.bump_city_epoch(&partition_key.city);
        }
        Ok(outcome)
    }

    /// Detach `key` from `cluster_id`. The member takes its own price
    /// observations; splitting a singleton is a no-op.
    pub fn split_in(
        &self,
        partition: &mut Partition,
        cluster_id: ClusterId,
        key: &ListingKey,
        now: DateTime<Utc>,
    ) -> Result<Option<SplitOutcome>> {
        let cluster = partition
            .clusters
            .get_mut(&cluster_id)
            .ok_or(EngineError::UnknownCluster(cluster_id))?;
        if !cluster.members.contains_key(key) {
            return Err(EngineError::UnknownMember {
                cluster_id,
                key: key.clone(),
            });
        }
        if cluster.members.len() == 1 {
            return Ok(None);
        }

        let Some(record) = cluster.members.remove(key) else {
            return Ok(None);
        };
        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut cluster.price_history)
            .into_iter()
            .partition(|o| &o.key == key);
        cluster.price_history = kept;
        cluster.recompute_representative();
        cluster.status = ClusterStatus::Split;
        cluster.bump_version(now);
        let partition_key = cluster.partition.clone();

        let new_id = self.store.next_id();
        let moved_observations = moved.len();
        let mut detached = CanonicalProperty::singleton(new_id, record.listing.clone());
        if let Some(member) = detached.members.get_mut(key) {
            member.first_seen = record.first_seen;
            member.last_confirmed = record.last_confirmed;
        }
        detached.price_history = moved;
        detached.created_at = now;
        detached.updated_at = now;

        partition.clusters.insert(new_id, detached);
        partition.index.insert(key.clone(), new_id);
        partition.mark_separated(cluster_id, new_id);
        self.store.record_cluster(new_id, &partition_key);

        info!(
            "Split {} out of {} into {} ({} observations moved)",
            key, cluster_id, new_id, moved_observations
        );
        Ok(Some(SplitOutcome {
            source: cluster_id,
            detached: key.clone(),
            new_cluster: new_id,
            moved_observations,
        }))
    }

    /// Retry every held listing of a partition
    pub fn retry_held(&self, partition: &mut Partition) -> Vec<(ListingKey, Result<Resolution>)> {
        let mut held = partition.take_held();
        held.sort_by(|a, b| {
            (a.listing.scraped_at, &a.listing.key).cmp(&(b.listing.scraped_at, &b.listing.key))
        });
        held.into_iter()
            .map(|h| {
                let key = h.listing.key.clone();
                (key, self.resolve_in(partition, h.listing, h.carried))
            })
            .collect()
    }

    /// Merge clusters of one partition that describe the same unit.
    ///
    /// Clusters are visited in id order; each one is absorbed into the
    /// single best lower-id cluster it clears the threshold against, as
    /// long as the two share no source and were never split apart.
    pub fn consolidate_in(&self, partition: &mut Partition, now: DateTime<Utc>) -> Vec<MergeOutcome> {
        let mut merges = Vec::new();
        let ids: Vec<ClusterId> = partition.clusters.keys().copied().collect();

        for absorbed_id in ids {
            let Some(absorbed) = partition.clusters.get(&absorbed_id) else {
                continue;
            };
            if absorbed.is_merged() || absorbed.members.is_empty() {
                continue;
            }
            let profile = MatchProfile::from(&absorbed.representative);
            let sources = absorbed.sources();

            let mut ranked: Vec<(ClusterId, f64)> = partition
                .clusters
                .range(..absorbed_id)
                .map(|(_, c)| c)
                .filter(|c| !c.is_merged() && !c.members.is_empty())
                .filter(|c| !partition.is_separated(c.id, absorbed_id))
                .filter(|c| c.sources().is_disjoint(&sources))
                .filter_map(|c| {
                    let candidate = MatchProfile::from(&c.representative);
                    if !similarity::passes_prefilter(&profile, &candidate, self.config) {
                        return None;
                    }
                    let score = similarity::similarity(&profile, &candidate, self.config).score;
                    (score >= self.config.merge_threshold).then_some((c.id, score))
                })
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

            let Some(&(survivor_id, score)) = ranked.first() else {
                continue;
            };
            if ranked
                .get(1)
                .is_some_and(|(_, s)| score - *s < self.config.ambiguity_margin)
            {
                debug!("Consolidation of {} is ambiguous, skipped", absorbed_id);
                continue;
            }

            self.absorb(partition, survivor_id, absorbed_id, now);
            merges.push(MergeOutcome {
                survivor: survivor_id,
                absorbed: absorbed_id,
                score,
            });
        }

        if !merges.is_empty() {
            info!("Consolidated {} cluster(s)", merges.len());
        }
        merges
    }

    fn absorb(&self, partition: &mut Partition, survivor_id: ClusterId, absorbed_id: ClusterId, now: DateTime<Utc>) {
        let Some(absorbed) = partition.clusters.get_mut(&absorbed_id) else {
            return;
        };
        let members = std::mem::take(&mut absorbed.members);
        let history = std::mem::take(&mut absorbed.price_history);
        absorbed.status = ClusterStatus::Merged { into: survivor_id };
        absorbed.current_price = None;
        absorbed.recommended_price = None;
        absorbed.bump_version(now);

        for key in members.keys() {
            partition.index.insert(key.clone(), survivor_id);
        }
        let separated_from_absorbed: Vec<ClusterId> = partition
            .separated
            .iter()
            .filter_map(|&(a, b)| {
                if a == absorbed_id {
                    Some(b)
                } else if b == absorbed_id {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        for other in separated_from_absorbed {
            partition.mark_separated(survivor_id, other);
        }

        if let Some(survivor) = partition.clusters.get_mut(&survivor_id) {
            survivor.members.extend(members);
            for observation in history {
                survivor.insert_observation(observation);
            }
            survivor.recompute_representative();
            survivor.bump_version(now);
        }
        info!("Merged {} into {}", absorbed_id, survivor_id);
    }
}
