//! Comparable-based valuation
//!
//! Estimates fair market value as median price per m² of comparable
//! properties times the subject's area, adjusted by a transparent set of
//! multiplicative factors. Every applied factor is reported so the
//! estimate can be explained line by line.

mod factors;


pub use factors::{AppliedFactor, FactorKind, FactorTable};

use crate::config::ValuationConfig;
use crate::types::{AgeBand, CanonicalProperty, ClusterId};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
    NoComparables,
}

/// Where the comparables came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Neighborhood,
    City,
}

/// Price-per-m² statistics of the comparable set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableStats {
    pub count: usize,
    pub median_ppm2: Decimal,
    pub mean_ppm2: Decimal,
    /// Population standard deviation
    pub std_dev_ppm2: Decimal,
    /// Coefficient of variation, std_dev / mean
    pub cv: Decimal,
}

impl ComparableStats {
    pub fn from_ppm2(values: &[Decimal]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort();

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / dec!(2)
        };

        let count = Decimal::from(n as u64);
        let mean = sorted.iter().sum::<Decimal>() / count;
        let variance = sorted.iter().map(|v| (*v - mean) * (*v - mean)).sum::<Decimal>() / count;
        let std_dev = variance.sqrt().unwrap_or(Decimal::ZERO);
        let cv = if mean > Decimal::ZERO {
            std_dev / mean
        } else {
            Decimal::ZERO
        };

        Some(Self {
            count: n,
            median_ppm2: median.round_dp(2),
            mean_ppm2: mean.round_dp(2),
            std_dev_ppm2: std_dev.round_dp(2),
            cv: cv.round_dp(4),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationResult {
    pub cluster_id: ClusterId,
    /// Cluster version the estimate was computed against
    pub version: u64,
    pub estimate: Option<Decimal>,
    pub band_low: Option<Decimal>,
    pub band_high: Option<Decimal>,
    /// Half-width of the band relative to the estimate
    pub band_pct: Option<Decimal>,
    pub tier: ConfidenceTier,
    pub granularity: Option<Granularity>,
    pub comparables: Vec<ClusterId>,
    pub stats: Option<ComparableStats>,
    /// Median price/m² times area, before factors
    pub base_value: Option<Decimal>,
    pub factors: Vec<AppliedFactor>,
    /// (estimate - recommended price) / estimate
    pub asking_discount: Option<Decimal>,
    pub computed_at: DateTime<Utc>,
}

impl ValuationResult {
    /// Equal apart from when it was computed
    pub fn same_outcome(&self, other: &Self) -> bool {
        Self {
            computed_at: other.computed_at,
            ..self.clone()
        } == *other
    }

    fn without_comparables(subject: &CanonicalProperty, computed_at: DateTime<Utc>) -> Self {
        Self {
            cluster_id: subject.id,
            version: subject.version,
            estimate: None,
            band_low: None,
            band_high: None,
            band_pct: None,
            tier: ConfidenceTier::NoComparables,
            granularity: None,
            comparables: Vec::new(),
            stats: None,
            base_value: None,
            factors: Vec::new(),
            asking_discount: None,
            computed_at,
        }
    }
}

pub struct ValuationModel {
    config: ValuationConfig,
}

impl ValuationModel {
    pub fn new(config: ValuationConfig) -> Self {
        Self { config }
    }

    fn is_comparable(&self, subject: &CanonicalProperty, other: &CanonicalProperty) -> bool {
        if other.id == subject.id || !other.is_active() || other.current_price.is_none() {
            return false;
        }
        if other.partition.city != subject.partition.city || other.representative.area_m2 <= Decimal::ZERO {
            return false;
        }

        let area = subject.representative.area_m2;
        if (other.representative.area_m2 - area).abs() > area * self.config.area_band_pct {
            return false;
        }

        match (subject.representative.rooms, other.representative.rooms) {
            (Some(a), Some(b)) => (a - b).abs() <= self.config.room_tolerance,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    /// Comparables from the subject's neighborhood, widened to the whole
    /// city when the neighborhood alone has too few
    pub fn comparables<'c>(
        &self,
        subject: &CanonicalProperty,
        city: &'c [CanonicalProperty],
    ) -> (Granularity, Vec<&'c CanonicalProperty>) {
        let candidates: Vec<&CanonicalProperty> = city.iter().filter(|c| self.is_comparable(subject, c)).collect();

        let local: Vec<&CanonicalProperty> = candidates
            .iter()
            .copied()
            .filter(|c| c.partition == subject.partition)
            .collect();

        if local.len() >= self.config.min_comparables {
            (Granularity::Neighborhood, local)
        } else {
            (Granularity::City, candidates)
        }
    }

    /// Value a cluster against a snapshot of every cluster in its city.
    ///
    /// Never fails: without comparables the result carries no estimate and
    /// the `NoComparables` tier.
    pub fn value(&self, subject: &CanonicalProperty, city: &[CanonicalProperty], computed_at: DateTime<Utc>) -> ValuationResult {
        let (granularity, comparables) = self.comparables(subject, city);

        let ppm2: Vec<Decimal> = comparables
            .iter()
            .filter_map(|c| c.current_price.map(|p| p / c.representative.area_m2))
            .collect();
        let Some(stats) = ComparableStats::from_ppm2(&ppm2) else {
            debug!("{} has no comparables", subject.id);
            return ValuationResult::without_comparables(subject, computed_at);
        };

        let base_value = stats.median_ppm2 * subject.representative.area_m2;

        let table = &self.config.factors;
        let rep = &subject.representative;
        let mut factors = Vec::new();
        if granularity == Granularity::City {
            factors.extend(table.neighborhood_factor(&subject.partition.neighborhood));
        }
        factors.extend(table.floor_factor(rep.floor.category()));
        factors.extend(table.heating_factor(rep.heating));
        factors.extend(table.legal_factor(rep.legal_status));
        factors.extend(table.condition_factor(rep.condition));
        if let Some(year_built) = rep.year_built {
            factors.extend(table.age_factor(AgeBand::of(year_built, computed_at.year(), rep.condition)));
        }
        factors.extend(table.parking_factor(rep.parking));
        factors.extend(rep.extras.iter().filter_map(|extra| table.extra_factor(*extra)));

        let multiplier = factors.iter().fold(Decimal::ONE, |acc, f| acc * f.multiplier);
        let estimate = (base_value * multiplier).round_dp(0);

        let n = Decimal::from(stats.count as u64);
        let size_term = self.config.size_band_coefficient / n.sqrt().unwrap_or(Decimal::ONE);
        let band_pct = (self.config.base_band_pct + stats.cv + size_term)
            .min(self.config.max_band_pct)
            .round_dp(4);

        let tier = match granularity {
            Granularity::Neighborhood if stats.cv <= self.config.high_confidence_max_cv => ConfidenceTier::High,
            Granularity::Neighborhood => ConfidenceTier::Medium,
            Granularity::City => ConfidenceTier::Low,
        };

        let asking_discount = subject
            .recommended_price
            .filter(|_| estimate > Decimal::ZERO)
            .map(|p| ((estimate - p) / estimate).round_dp(4));

        debug!(
            "{} valued at {} ({:?}, {} comparables, band ±{})",
            subject.id, estimate, tier, stats.count, band_pct
        );

        ValuationResult {
            cluster_id: subject.id,
            version: subject.version,
            estimate: Some(estimate),
            band_low: Some((estimate * (Decimal::ONE - band_pct)).round_dp(0)),
            band_high: Some((estimate * (Decimal::ONE + band_pct)).round_dp(0)),
            band_pct: Some(band_pct),
            tier,
            granularity: Some(granularity),
            comparables: comparables.iter().map(|c| c.id).collect(),
            stats: Some(stats),
            base_value: Some(base_value.round_dp(0)),
            factors,
            asking_discount,
            computed_at,
        }
    }
}
