//! Individual fraud and manipulation rules
//!
//! Rules only detect. Weights, enable flags and thresholds all come from
//! the rule table in configuration; the scorer combines the hits.

use super::{FraudContext, RuleHit};
use crate::normalize::parse::fold;
use crate::pricing;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleName {
    UrgencyClaim,
    DuplicateImage,
    PriceVolatility,
    AgentVolume,
    MissingContact,
    UnderpricingOutlier,
    Overselling,
    CrossSourcePriceSpread,
}

impl RuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleName::UrgencyClaim => "urgency_claim",
            RuleName::DuplicateImage => "duplicate_image",
            RuleName::PriceVolatility => "price_volatility",
            RuleName::AgentVolume => "agent_volume",
            RuleName::MissingContact => "missing_contact",
            RuleName::UnderpricingOutlier => "underpricing_outlier",
            RuleName::Overselling => "overselling",
            RuleName::CrossSourcePriceSpread => "cross_source_price_spread",
        }
    }
}

impl fmt::Display for RuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detector evaluated against one cluster
pub trait Rule: Send + Sync {
    fn name(&self) -> RuleName;

    /// Strength in [0, 1] when the rule fires
    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit>;
}

/// Every built-in rule
pub fn standard_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(UrgencyClaim),
        Box::new(DuplicateImage),
        Box::new(PriceVolatility),
        Box::new(AgentVolume),
        Box::new(MissingContact),
        Box::new(UnderpricingOutlier),
        Box::new(Overselling),
        Box::new(CrossSourcePriceSpread),
    ]
}

/// Urgent-sale claim on a listing that has been on the market for a while
pub struct UrgencyClaim;

impl Rule for UrgencyClaim {
    fn name(&self) -> RuleName {
        RuleName::UrgencyClaim
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let min_age = ctx.config.urgency_min_age_days;
        let age = ctx
            .cluster
            .members
            .values()
            .filter(|m| m.listing.urgent)
            .map(|m| m.age_days(ctx.as_of))
            .max()?;
        (age > min_age).then(|| RuleHit::full(format!("urgent claim on a listing {} days old", age)))
    }
}

/// Same photo reused by several other properties
pub struct DuplicateImage;

impl Rule for DuplicateImage {
    fn name(&self) -> RuleName {
        RuleName::DuplicateImage
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let min_clusters = ctx.config.duplicate_image_min_clusters;
        let (hash, others) = ctx
            .cluster
            .representative
            .image_hashes
            .iter()
            .map(|hash| (hash, ctx.market.other_image_owners(hash, ctx.cluster.id)))
            .max_by_key(|(_, count)| *count)?;

        (others >= min_clusters.max(1))
            .then(|| RuleHit::full(format!("image {} also used by {} other properties", hash, others)))
    }
}

/// Frequent price changes inside the volatility window
pub struct PriceVolatility;

impl Rule for PriceVolatility {
    fn name(&self) -> RuleName {
        RuleName::PriceVolatility
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let since = ctx.as_of - chrono::Duration::days(ctx.config.volatility_window_days);
        let changes = pricing::price_change_count(ctx.cluster, since);
        (changes >= ctx.config.volatility_min_changes).then(|| {
            RuleHit::full(format!(
                "{} price changes in {} days",
                changes, ctx.config.volatility_window_days
            ))
        })
    }
}

/// Agent with an unusually large active inventory.
///
/// Strength starts at one half at the threshold and saturates at twice it.
pub struct AgentVolume;

impl Rule for AgentVolume {
    fn name(&self) -> RuleName {
        RuleName::AgentVolume
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let threshold = ctx.config.agent_volume_min_listings;
        let (agent, count) = ctx
            .cluster
            .members
            .values()
            .filter_map(|m| m.listing.agent_id.as_deref())
            .map(|agent| (agent, ctx.market.agent_listings(agent)))
            .max_by_key(|(_, count)| *count)?;

        if threshold == 0 || count < threshold {
            return None;
        }
        let excess = Decimal::from((count - threshold) as u64) / Decimal::from(threshold as u64);
        let strength = Decimal::new(5, 1) + Decimal::new(5, 1) * excess.min(Decimal::ONE);
        Some(RuleHit {
            strength,
            detail: format!("agent {} has {} active listings", agent, count),
        })
    }
}

/// No member exposes a phone number
pub struct MissingContact;

impl Rule for MissingContact {
    fn name(&self) -> RuleName {
        RuleName::MissingContact
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let any_phone = ctx.cluster.members.values().any(|m| m.listing.has_phone);
        (!any_phone).then(|| RuleHit::full("no member lists a phone number"))
    }
}

/// Recommended price far below what comparables support
pub struct UnderpricingOutlier;

impl Rule for UnderpricingOutlier {
    fn name(&self) -> RuleName {
        RuleName::UnderpricingOutlier
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let stats = ctx.valuation?.stats.as_ref()?;
        if stats.count < ctx.config.underpricing_min_comparables {
            return None;
        }
        let price = ctx.cluster.recommended_price?;
        let area = ctx.cluster.representative.area_m2;
        let floor_ppm2 = stats.median_ppm2 - ctx.config.underpricing_std_devs * stats.std_dev_ppm2;
        let threshold = floor_ppm2 * area;

        (price < threshold).then(|| {
            RuleHit::full(format!(
                "recommended price {} below {} ({} comparables, median {}/m²)",
                price,
                threshold.round_dp(0),
                stats.count,
                stats.median_ppm2
            ))
        })
    }
}

/// Marketing superlatives piled into a title
pub struct Overselling;

impl Rule for Overselling {
    fn name(&self) -> RuleName {
        RuleName::Overselling
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        let buzzwords: Vec<String> = ctx.config.buzzwords.iter().map(|b| fold(b)).collect();
        let best = ctx
            .cluster
            .members
            .values()
            .map(|m| {
                let title = fold(&m.listing.title);
                buzzwords
                    .iter()
                    .filter(|b| !b.is_empty() && title.contains(b.as_str()))
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .max()?;

        (best >= ctx.config.overselling_min_buzzwords.max(1))
            .then(|| RuleHit::full(format!("{} marketing buzzwords in title", best)))
    }
}

/// Sources disagree on the price of one unit
pub struct CrossSourcePriceSpread;

impl Rule for CrossSourcePriceSpread {
    fn name(&self) -> RuleName {
        RuleName::CrossSourcePriceSpread
    }

    fn evaluate(&self, ctx: &FraudContext<'_>) -> Option<RuleHit> {
        if ctx.cluster.sources().len() < 2 {
            return None;
        }
        let prices = pricing::latest_prices(ctx.cluster);
        let spread = pricing::price_spread(&prices)?;
        (spread > ctx.config.price_spread_max_pct)
            .then(|| RuleHit::full(format!("member prices differ by {}%", (spread * Decimal::ONE_HUNDRED).round_dp(1))))
    }
}
