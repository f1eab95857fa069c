//! Pairwise similarity between a listing and a cluster representative
//!
//! Each component scores in [0, 1]. Components that cannot be computed
//! (missing on either side) drop out and the remaining weights are
//! renormalized. Without any identity evidence (geo, street or images)
//! the score is zero no matter how well the attributes agree.

use crate::config::ResolverConfig;
use crate::types::{Floor, GeoPoint, HeatingType, LegalStatus, NormalizedListing, RepresentativeAttributes};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

/// The attributes resolution looks at, borrowed from either side
#[derive(Debug, Clone, Copy)]
pub struct MatchProfile<'a> {
    pub area_m2: Decimal,
    pub rooms: Option<Decimal>,
    pub floor: Floor,
    pub heating: HeatingType,
    pub legal_status: LegalStatus,
    pub street: Option<&'a str>,
    pub geo: Option<GeoPoint>,
    pub images: &'a BTreeSet<String>,
}

impl<'a> From<&'a NormalizedListing> for MatchProfile<'a> {
    fn from(listing: &'a NormalizedListing) -> Self {
        Self {
            area_m2: listing.area_m2,
            rooms: listing.rooms,
            floor: listing.floor,
            heating: listing.heating,
            legal_status: listing.legal_status,
            street: listing.street.as_deref(),
            geo: listing.geo,
            images: &listing.image_hashes,
        }
    }
}

impl<'a> From<&'a RepresentativeAttributes> for MatchProfile<'a> {
    fn from(rep: &'a RepresentativeAttributes) -> Self {
        Self {
            area_m2: rep.area_m2,
            rooms: rep.rooms,
            floor: rep.floor,
            heating: rep.heating,
            legal_status: rep.legal_status,
            street: rep.street.as_deref(),
            geo: rep.geo,
            images: &rep.image_hashes,
        }
    }
}

/// Per-component breakdown, kept for debug logging
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimilarityBreakdown {
    pub geo: Option<f64>,
    pub street: Option<f64>,
    pub images: Option<f64>,
    pub attributes: f64,
    pub score: f64,
}

/// Cheap structural checks run before any scoring.
///
/// Area must be within the tolerance of the candidate, and room counts
/// within the room tolerance (two absent counts also pass).
pub fn passes_prefilter(listing: &MatchProfile<'_>, candidate: &MatchProfile<'_>, config: &ResolverConfig) -> bool {
    if candidate.area_m2 <= Decimal::ZERO {
        return false;
    }
    let area_diff = (listing.area_m2 - candidate.area_m2).abs();
    if area_diff > candidate.area_m2 * config.area_tolerance_pct {
        return false;
    }

    match (listing.rooms, candidate.rooms) {
        (Some(a), Some(b)) => (a - b).abs() <= config.room_tolerance,
        (None, None) => true,
        _ => false,
    }
}

pub fn geo_score(a: &GeoPoint, b: &GeoPoint, scale_m: f64) -> f64 {
    let distance = a.distance_m(b);
    1.0 / (1.0 + distance / scale_m.max(f64::EPSILON))
}

pub fn street_score(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Jaccard overlap; any shared hash lifts the score to at least `floor`
pub fn image_score(a: &BTreeSet<String>, b: &BTreeSet<String>, floor: f64) -> f64 {
    let shared = a.intersection(b).count();
    if shared == 0 {
        return 0.0;
    }
    let union = a.union(b).count();
    let jaccard = shared as f64 / union as f64;
    jaccard.max(floor)
}

/// Fraction of floor, heating and legal status that are known and equal
pub fn attribute_score(a: &MatchProfile<'_>, b: &MatchProfile<'_>) -> f64 {
    let matches = [
        a.floor.is_known() && a.floor == b.floor,
        a.heating != HeatingType::Unknown && a.heating == b.heating,
        a.legal_status != LegalStatus::Unknown && a.legal_status == b.legal_status,
    ]
    .iter()
    .filter(|m| **m)
    .count();
    matches as f64 / 3.0
}

pub fn similarity(a: &MatchProfile<'_>, b: &MatchProfile<'_>, config: &ResolverConfig) -> SimilarityBreakdown {
    let geo = match (a.geo, b.geo) {
        (Some(x), Some(y)) => Some(geo_score(&x, &y, config.geo_scale_m)),
        _ => None,
    };
    let street = match (a.street, b.street) {
        (Some(x), Some(y)) => Some(street_score(x, y)),
        _ => None,
    };
    let images = if a.images.is_empty() || b.images.is_empty() {
        None
    } else {
        Some(image_score(a.images, b.images, config.image_overlap_floor))
    };
    let attributes = attribute_score(a, b);

    let mut breakdown = SimilarityBreakdown {
        geo,
        street,
        images,
        attributes,
        score: 0.0,
    };
    if geo.is_none() && street.is_none() && images.is_none() {
        return breakdown;
    }

    let w = &config.weights;
    let components = [
        (geo, w.geo),
        (street, w.street),
        (images, w.images),
        (Some(attributes), w.attributes),
    ];
    let (weighted, total_weight) = components
        .iter()
        .filter_map(|(score, weight)| score.map(|s| (s * weight, *weight)))
        .fold((0.0, 0.0), |(acc, tw), (s, w)| (acc + s, tw + w));

    if total_weight > 0.0 {
        breakdown.score = (weighted / total_weight).clamp(0.0, 1.0);
    }
    breakdown
}
