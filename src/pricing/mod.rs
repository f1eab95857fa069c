//! Price reconciliation
//!
//! Merges the prices reported by each member of a cluster into one current
//! price and a recommended offer. Every member keeps its own append-only
//! history, so a split can hand observations back to the detached listing.


use crate::config::PricingConfig;
use crate::types::{CanonicalProperty, ClusterId, ClusterStatus, ListingKey, PriceObservation};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Recommended price moved by more than the configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDelta {
    pub cluster_id: ClusterId,
    pub previous: Decimal,
    pub current: Decimal,
    /// Signed relative change, (current - previous) / previous
    pub change_pct: Decimal,
    pub at: DateTime<Utc>,
}

/// What one reconciliation changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub cluster_id: ClusterId,
    pub current_price: Option<Decimal>,
    pub recommended_price: Option<Decimal>,
    pub status: ClusterStatus,
    pub active_members: usize,
    pub delta: Option<PriceDelta>,
    /// Price or status differs from before; the version was bumped
    pub changed: bool,
}

pub struct PriceReconciler {
    config: PricingConfig,
}

impl PriceReconciler {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Record a member's price. Appends only for a first sighting or a
    /// change against the member's previous observation; returns whether
    /// anything was appended.
    pub fn observe(
        &self,
        cluster: &mut CanonicalProperty,
        key: &ListingKey,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let mut previous: Option<&PriceObservation> = None;
        for observation in cluster.history_of(key) {
            if observation.observed_at == observed_at {
                return false;
            }
            if observation.observed_at < observed_at {
                previous = Some(observation);
            }
        }

        if previous.is_some_and(|p| p.price == price) {
            return false;
        }

        debug!("{} observed {} at {}", key, price, observed_at);
        cluster.insert_observation(PriceObservation {
            key: key.clone(),
            price,
            observed_at,
        });
        true
    }

    /// Members confirmed within the staleness window
    pub fn is_member_active(&self, last_confirmed: DateTime<Utc>, as_of: DateTime<Utc>) -> bool {
        as_of - last_confirmed <= Duration::days(self.config.staleness_days)
    }

    /// Latest observed price of every active member
    pub fn active_prices<'c>(&self, cluster: &'c CanonicalProperty, as_of: DateTime<Utc>) -> BTreeMap<&'c ListingKey, Decimal> {
        let latest = latest_prices(cluster);
        cluster
            .members
            .iter()
            .filter(|(_, m)| self.is_member_active(m.last_confirmed, as_of))
            .filter_map(|(key, _)| latest.get(key).map(|price| (key, *price)))
            .collect()
    }

    /// Recompute current and recommended price and the staleness status
    pub fn reconcile(&self, cluster: &mut CanonicalProperty, as_of: DateTime<Utc>) -> ReconcileReport {
        if cluster.is_merged() {
            return ReconcileReport {
                cluster_id: cluster.id,
                current_price: None,
                recommended_price: None,
                status: cluster.status,
                active_members: 0,
                delta: None,
                changed: false,
            };
        }

        let active = self.active_prices(cluster, as_of);
        let active_members = active.len();
        let current = active.values().min().copied();
        let recommended = current.map(|c| (c * (Decimal::ONE - self.config.safety_margin_pct)).round_dp(2));

        let status = match (current, cluster.status) {
            (None, _) => ClusterStatus::Stale,
            (Some(_), ClusterStatus::Split) => ClusterStatus::Split,
            (Some(_), _) => ClusterStatus::Active,
        };

        let delta = match (cluster.recommended_price, recommended) {
            (Some(previous), Some(now)) if previous > Decimal::ZERO => {
                let change_pct = (now - previous) / previous;
                (change_pct.abs() > self.config.delta_threshold_pct).then(|| PriceDelta {
                    cluster_id: cluster.id,
                    previous,
                    current: now,
                    change_pct: change_pct.round_dp(4),
                    at: as_of,
                })
            }
            _ => None,
        };

        let changed =
            cluster.current_price != current || cluster.recommended_price != recommended || cluster.status != status;
        if changed {
            if cluster.status != status {
                debug!("{} status {:?} -> {:?}", cluster.id, cluster.status, status);
            }
            cluster.current_price = current;
            cluster.recommended_price = recommended;
            cluster.status = status;
            cluster.bump_version(as_of);
        }

        ReconcileReport {
            cluster_id: cluster.id,
            current_price: current,
            recommended_price: recommended,
            status,
            active_members,
            delta,
            changed,
        }
    }
}

/// Latest observation per member key
pub fn latest_prices(cluster: &CanonicalProperty) -> BTreeMap<&ListingKey, Decimal> {
    // History is ordered by time, so later entries overwrite earlier ones
    cluster
        .price_history
        .iter()
        .map(|o| (&o.key, o.price))
        .collect()
}

/// Number of price changes observed since `since`. A member's first
/// observation is a sighting, not a change.
pub fn price_change_count(cluster: &CanonicalProperty, since: DateTime<Utc>) -> usize {
    let mut seen: BTreeMap<&ListingKey, Decimal> = BTreeMap::new();
    let mut changes = 0;
    for observation in &cluster.price_history {
        let previous = seen.insert(&observation.key, observation.price);
        if observation.observed_at >= since && previous.is_some_and(|p| p != observation.price) {
            changes += 1;
        }
    }
    changes
}

/// Relative spread between the highest and lowest active member price
pub fn price_spread(prices: &BTreeMap<&ListingKey, Decimal>) -> Option<Decimal> {
    let min = prices.values().min()?;
    let max = prices.values().max()?;
    if *min <= Decimal::ZERO {
        return None;
    }
    Some((max - min) / min)
}
