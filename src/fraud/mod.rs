//! Fraud and manipulation scoring
//!
//! A data-driven rule table scored by one generic scorer. Each enabled
//! rule contributes `strength * weight`; the composite is capped at 1.0 and
//! mapped to a risk tier by configured cut points.

mod rules;

#[cfg(test)]
mod tests;

pub use rules::{standard_rules, Rule, RuleName};

use crate::config::{FraudConfig, TierThresholds};
use crate::types::{CanonicalProperty, ClusterId};
use crate::valuation::ValuationResult;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    None,
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn from_score(score: Decimal, tiers: &TierThresholds) -> Self {
        if score >= tiers.high {
            RiskTier::High
        } else if score >= tiers.medium {
            RiskTier::Medium
        } else if score >= tiers.low {
            RiskTier::Low
        } else {
            RiskTier::None
        }
    }
}

/// A rule that fired, with the strength it fired at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    pub strength: Decimal,
    pub detail: String,
}

impl RuleHit {
    pub fn full(detail: impl Into<String>) -> Self {
        Self {
            strength: Decimal::ONE,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub rule: RuleName,
    pub weight: Decimal,
    pub strength: Decimal,
    pub contribution: Decimal,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudSignal {
    pub cluster_id: ClusterId,
    /// Cluster version the signal was computed against
    pub version: u64,
    pub triggered: Vec<TriggeredRule>,
    /// Composite score in [0, 1]
    pub score: Decimal,
    pub tier: RiskTier,
    pub computed_at: DateTime<Utc>,
}

impl FraudSignal {
    /// Equal apart from when it was computed
    pub fn same_outcome(&self, other: &Self) -> bool {
        Self {
            computed_at: other.computed_at,
            ..self.clone()
        } == *other
    }
}

/// City-wide lookups shared by every cluster scored in one pass
#[derive(Debug, Clone, Default)]
pub struct MarketIndex {
    /// Agent -> number of active properties carrying one of its listings
    agent_counts: HashMap<String, usize>,
    /// Image hash -> active properties showing it
    image_owners: HashMap<String, BTreeSet<ClusterId>>,
}

impl MarketIndex {
    pub fn build(clusters: &[CanonicalProperty]) -> Self {
        let mut index = Self::default();
        for cluster in clusters.iter().filter(|c| c.is_active()) {
            let agents: BTreeSet<&str> = cluster
                .members
                .values()
                .filter_map(|m| m.listing.agent_id.as_deref())
                .collect();
            for agent in agents {
                *index.agent_counts.entry(agent.to_string()).or_insert(0) += 1;
            }
            for hash in &cluster.representative.image_hashes {
                index.image_owners.entry(hash.clone()).or_default().insert(cluster.id);
            }
        }
        index
    }

    pub fn agent_listings(&self, agent: &str) -> usize {
        self.agent_counts.get(agent).copied().unwrap_or(0)
    }

    /// Active properties other than `owner` that show this image
    pub fn other_image_owners(&self, hash: &str, owner: ClusterId) -> usize {
        self.image_owners
            .get(hash)
            .map(|owners| owners.iter().filter(|id| **id != owner).count())
            .unwrap_or(0)
    }
}

/// Everything a rule may look at
pub struct FraudContext<'a> {
    pub cluster: &'a CanonicalProperty,
    pub valuation: Option<&'a ValuationResult>,
    pub market: &'a MarketIndex,
    pub config: &'a FraudConfig,
    pub as_of: DateTime<Utc>,
}

pub struct FraudScorer {
    config: FraudConfig,
    rules: Vec<Box<dyn Rule>>,
}

impl FraudScorer {
    pub fn new(config: FraudConfig) -> Self {
        Self::with_rules(config, standard_rules())
    }

    pub fn with_rules(config: FraudConfig, rules: Vec<Box<dyn Rule>>) -> Self {
        Self { config, rules }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    pub fn score(
        &self,
        cluster: &CanonicalProperty,
        valuation: Option<&ValuationResult>,
        market: &MarketIndex,
        as_of: DateTime<Utc>,
    ) -> FraudSignal {
        let ctx = FraudContext {
            cluster,
            valuation,
            market,
            config: &self.config,
            as_of,
        };

        let mut triggered = Vec::new();
        for rule in &self.rules {
            let Some(setting) = self.config.rules.get(&rule.name()).filter(|s| s.enabled) else {
                continue;
            };
            if let Some(hit) = rule.evaluate(&ctx) {
                let strength = hit.strength.clamp(Decimal::ZERO, Decimal::ONE);
                triggered.push(TriggeredRule {
                    rule: rule.name(),
                    weight: setting.weight,
                    strength,
                    contribution: strength * setting.weight,
                    detail: hit.detail,
                });
            }
        }

        let score = triggered
            .iter()
            .map(|t| t.contribution)
            .sum::<Decimal>()
            .min(Decimal::ONE);
        let tier = RiskTier::from_score(score, &self.config.tiers);

        if !triggered.is_empty() {
            debug!(
                "{} fraud score {} ({:?}): {}",
                cluster.id,
                score,
                tier,
                triggered.iter().map(|t| t.rule.as_str()).collect::<Vec<_>>().join(", ")
            );
        }

        FraudSignal {
            cluster_id: cluster.id,
            version: cluster.version,
            triggered,
            score,
            tier,
            computed_at: as_of,
        }
    }
}
