use super::*;
use crate::config::RuleSetting;
use crate::pricing::PriceReconciler;
use crate::testing::{day, listing};
use crate::types::{ListingKey, MemberRecord};
use crate::valuation::{ComparableStats, ConfidenceTier, Granularity};
use rust_decimal_macros::dec;

fn scorer() -> FraudScorer {
    FraudScorer::new(FraudConfig::default())
}

fn property(id: u64, source: &str) -> CanonicalProperty {
    CanonicalProperty::singleton(ClusterId(id), listing(source, &id.to_string(), day(0)))
}

/// Active clusters carrying `agent` with no photos of their own
fn agent_inventory(agent: &str, count: u64) -> Vec<CanonicalProperty> {
    (0..count)
        .map(|i| {
            let mut member = listing("other", &format!("inv-{}", i), day(0));
            member.agent_id = Some(agent.to_string());
            member.image_hashes.clear();
            CanonicalProperty::singleton(ClusterId(1000 + i), member)
        })
        .collect()
}

fn fired(signal: &FraudSignal) -> Vec<RuleName> {
    signal.triggered.iter().map(|t| t.rule).collect()
}

fn valuation_with(stats: ComparableStats, cluster: &CanonicalProperty) -> ValuationResult {
    ValuationResult {
        cluster_id: cluster.id,
        version: cluster.version,
        estimate: Some(dec!(143000)),
        band_low: None,
        band_high: None,
        band_pct: None,
        tier: ConfidenceTier::High,
        granularity: Some(Granularity::Neighborhood),
        comparables: Vec::new(),
        stats: Some(stats),
        base_value: None,
        factors: Vec::new(),
        asking_discount: None,
        computed_at: day(0),
    }
}

#[test]
fn test_tier_cut_points() {
    let tiers = TierThresholds::default();
    assert_eq!(RiskTier::from_score(dec!(0), &tiers), RiskTier::None);
    assert_eq!(RiskTier::from_score(dec!(0.19), &tiers), RiskTier::None);
    assert_eq!(RiskTier::from_score(dec!(0.2), &tiers), RiskTier::Low);
    assert_eq!(RiskTier::from_score(dec!(0.4), &tiers), RiskTier::Medium);
    assert_eq!(RiskTier::from_score(dec!(0.7), &tiers), RiskTier::High);
    assert_eq!(RiskTier::from_score(dec!(1), &tiers), RiskTier::High);
}

#[test]
fn test_clean_listing_scores_zero() {
    let cluster = property(1, "a");
    let market = MarketIndex::build(std::slice::from_ref(&cluster));
    let signal = scorer().score(&cluster, None, &market, day(1));
    assert!(signal.triggered.is_empty());
    assert_eq!(signal.score, Decimal::ZERO);
    assert_eq!(signal.tier, RiskTier::None);
    assert_eq!(signal.version, cluster.version);
}

#[test]
fn test_urgent_old_listing_from_busy_agent_reaches_medium() {
    let mut member = listing("a", "1", day(0));
    member.urgent = true;
    member.agent_id = Some("agent-x".to_string());
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);

    let mut city = agent_inventory("agent-x", 37);
    city.push(cluster.clone());
    let market = MarketIndex::build(&city);
    assert_eq!(market.agent_listings("agent-x"), 38);

    let signal = scorer().score(&cluster, None, &market, day(73));
    let rules = fired(&signal);
    assert!(rules.contains(&RuleName::UrgencyClaim));
    assert!(rules.contains(&RuleName::AgentVolume));
    assert_eq!(signal.score, dec!(0.50));
    assert!(signal.tier >= RiskTier::Medium);
}

#[test]
fn test_fresh_urgent_listing_not_flagged() {
    let mut member = listing("a", "1", day(0));
    member.urgent = true;
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = scorer().score(&cluster, None, &market, day(20));
    assert!(!fired(&signal).contains(&RuleName::UrgencyClaim));
}

#[test]
fn test_agent_volume_strength_scales() {
    let mut member = listing("a", "1", day(0));
    member.agent_id = Some("agent-y".to_string());
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);

    // 14 others + the subject = 15 listings, half way to saturation
    let mut city = agent_inventory("agent-y", 14);
    city.push(cluster.clone());
    let market = MarketIndex::build(&city);

    let signal = scorer().score(&cluster, None, &market, day(1));
    let hit = signal
        .triggered
        .iter()
        .find(|t| t.rule == RuleName::AgentVolume)
        .unwrap();
    assert_eq!(hit.strength, dec!(0.75));
    assert_eq!(hit.contribution, dec!(0.1875));
}

#[test]
fn test_duplicate_image_across_clusters() {
    let a = property(1, "a");
    let b = property(2, "b");
    let c = property(3, "c");
    let market = MarketIndex::build(&[a.clone(), b, c]);

    let signal = scorer().score(&a, None, &market, day(1));
    assert!(fired(&signal).contains(&RuleName::DuplicateImage));

    let market = MarketIndex::build(&[a.clone(), property(2, "b")]);
    let signal = scorer().score(&a, None, &market, day(1));
    assert!(!fired(&signal).contains(&RuleName::DuplicateImage));
}

#[test]
fn test_missing_contact() {
    let mut member = listing("a", "1", day(0));
    member.has_phone = false;
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = scorer().score(&cluster, None, &market, day(1));
    assert_eq!(fired(&signal), vec![RuleName::MissingContact]);
    assert_eq!(signal.score, dec!(0.15));
    assert_eq!(signal.tier, RiskTier::None);
}

#[test]
fn test_price_volatility() {
    let pricing = PriceReconciler::new(crate::config::PricingConfig::default());
    let mut cluster = property(1, "a");
    let key = ListingKey::new("a", "1");
    for (d, price) in [(0, 125000), (5, 121000), (12, 118000), (20, 123000)] {
        pricing.observe(&mut cluster, &key, Decimal::from(price), day(d));
    }
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = scorer().score(&cluster, None, &market, day(25));
    assert!(fired(&signal).contains(&RuleName::PriceVolatility));

    let signal = scorer().score(&cluster, None, &market, day(45));
    assert!(!fired(&signal).contains(&RuleName::PriceVolatility));
}

fn comparable_stats(count: usize) -> ComparableStats {
    ComparableStats {
        count,
        median_ppm2: dec!(2200),
        mean_ppm2: dec!(2200),
        std_dev_ppm2: dec!(141.42),
        cv: dec!(0.0643),
    }
}

#[test]
fn test_underpricing_outlier() {
    // floor: (2200 - 2 * 141.42) * 65 = 124615.4
    let mut cluster = property(1, "a");
    cluster.current_price = Some(dec!(125000));
    cluster.recommended_price = Some(dec!(118750));
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let valuation = valuation_with(comparable_stats(5), &cluster);
    let signal = scorer().score(&cluster, Some(&valuation), &market, day(1));
    assert!(fired(&signal).contains(&RuleName::UnderpricingOutlier));

    // Too few comparables to trust the spread
    let valuation = valuation_with(comparable_stats(2), &cluster);
    let signal = scorer().score(&cluster, Some(&valuation), &market, day(1));
    assert!(!fired(&signal).contains(&RuleName::UnderpricingOutlier));

    // Only the recommended price counts, not the cheapest asking price
    cluster.current_price = Some(dec!(100000));
    cluster.recommended_price = Some(dec!(140000));
    let valuation = valuation_with(comparable_stats(5), &cluster);
    let signal = scorer().score(&cluster, Some(&valuation), &market, day(1));
    assert!(!fired(&signal).contains(&RuleName::UnderpricingOutlier));

    cluster.recommended_price = None;
    let signal = scorer().score(&cluster, Some(&valuation), &market, day(1));
    assert!(!fired(&signal).contains(&RuleName::UnderpricingOutlier));
}

#[test]
fn test_overselling_buzzwords() {
    let mut member = listing("a", "1", day(0));
    member.title = "LUX ekskluzivan stan, jedinstvena prilika".to_string();
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = scorer().score(&cluster, None, &market, day(1));
    let hit = signal.triggered.iter().find(|t| t.rule == RuleName::Overselling).unwrap();
    assert!(hit.detail.starts_with("3 "));
}

#[test]
fn test_cross_source_price_spread() {
    let pricing = PriceReconciler::new(crate::config::PricingConfig::default());
    let mut cluster = property(1, "a");
    let other = listing("b", "1", day(0));
    cluster.members.insert(other.key.clone(), MemberRecord::new(other));
    pricing.observe(&mut cluster, &ListingKey::new("a", "1"), dec!(100000), day(0));
    pricing.observe(&mut cluster, &ListingKey::new("b", "1"), dec!(125000), day(0));
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = scorer().score(&cluster, None, &market, day(1));
    assert!(fired(&signal).contains(&RuleName::CrossSourcePriceSpread));
}

#[test]
fn test_disabled_rule_is_skipped() {
    let mut config = FraudConfig::default();
    config.rules.insert(
        RuleName::MissingContact,
        RuleSetting {
            weight: dec!(0.15),
            enabled: false,
        },
    );
    let mut member = listing("a", "1", day(0));
    member.has_phone = false;
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = FraudScorer::new(config).score(&cluster, None, &market, day(1));
    assert!(signal.triggered.is_empty());
}

#[test]
fn test_composite_score_capped_at_one() {
    let mut config = FraudConfig::default();
    for setting in config.rules.values_mut() {
        setting.weight = dec!(0.9);
    }
    let mut member = listing("a", "1", day(0));
    member.has_phone = false;
    member.urgent = true;
    member.title = "lux ekskluziv".to_string();
    let cluster = CanonicalProperty::singleton(ClusterId(1), member);
    let market = MarketIndex::build(std::slice::from_ref(&cluster));

    let signal = FraudScorer::new(config).score(&cluster, None, &market, day(90));
    assert!(signal.triggered.len() >= 3);
    assert_eq!(signal.score, Decimal::ONE);
    assert_eq!(signal.tier, RiskTier::High);
}
