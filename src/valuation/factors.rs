//! Multiplicative adjustment table for the valuation model

use crate::types::{AgeBand, Condition, Extra, FloorCategory, HeatingType, LegalStatus, Parking};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which attribute a multiplier was looked up by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Neighborhood,
    Floor,
    Heating,
    LegalStatus,
    Condition,
    BuildingAge,
    Parking,
    Extra,
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FactorKind::Neighborhood => "neighborhood",
            FactorKind::Floor => "floor",
            FactorKind::Heating => "heating",
            FactorKind::LegalStatus => "legal_status",
            FactorKind::Condition => "condition",
            FactorKind::BuildingAge => "building_age",
            FactorKind::Parking => "parking",
            FactorKind::Extra => "extras",
        };
        f.write_str(name)
    }
}

/// One multiplier that was applied to an estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFactor {
    pub kind: FactorKind,
    pub key: String,
    pub multiplier: Decimal,
    pub reason: String,
}

/// Category -> multiplier tables, keyed the way they appear in configuration:
///
/// ```toml
/// [valuation.factors.floor]
/// ground = 0.85
/// top_no_elevator = 0.85
///
/// [valuation.factors.legal_status]
/// uknjizen = 1.0
/// bez_papira = 0.70
///
/// [valuation.factors.building_age]
/// new = 1.15
/// over_30_original = 0.75
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorTable {
    /// Folded neighborhood name -> multiplier, only used for city-wide comparables
    #[serde(default)]
    pub neighborhood: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub floor: BTreeMap<FloorCategory, Decimal>,
    #[serde(default)]
    pub heating: BTreeMap<HeatingType, Decimal>,
    #[serde(default)]
    pub legal_status: BTreeMap<LegalStatus, Decimal>,
    #[serde(default)]
    pub condition: BTreeMap<Condition, Decimal>,
    #[serde(default)]
    pub building_age: BTreeMap<AgeBand, Decimal>,
    #[serde(default)]
    pub parking: BTreeMap<Parking, Decimal>,
    /// One multiplier per amenity present
    #[serde(default)]
    pub extras: BTreeMap<Extra, Decimal>,
}

impl FactorTable {
    pub fn is_empty(&self) -> bool {
        self.values().next().is_none()
    }

    /// Every multiplier in the table
    pub fn values(&self) -> impl Iterator<Item = &Decimal> {
        self.neighborhood
            .values()
            .chain(self.floor.values())
            .chain(self.heating.values())
            .chain(self.legal_status.values())
            .chain(self.condition.values())
            .chain(self.building_age.values())
            .chain(self.parking.values())
            .chain(self.extras.values())
    }

    pub fn neighborhood_factor(&self, neighborhood: &str) -> Option<AppliedFactor> {
        let multiplier = *self.neighborhood.get(neighborhood)?;
        Some(AppliedFactor {
            kind: FactorKind::Neighborhood,
            key: neighborhood.to_string(),
            multiplier,
            reason: format!("city-wide comparables adjusted for {}", neighborhood),
        })
    }

    pub fn floor_factor(&self, category: FloorCategory) -> Option<AppliedFactor> {
        if category == FloorCategory::Unknown {
            return None;
        }
        let multiplier = *self.floor.get(&category)?;
        Some(AppliedFactor {
            kind: FactorKind::Floor,
            key: category.as_str().to_string(),
            multiplier,
            reason: format!("floor position {}", category.as_str()),
        })
    }

    pub fn heating_factor(&self, heating: HeatingType) -> Option<AppliedFactor> {
        if heating == HeatingType::Unknown {
            return None;
        }
        let multiplier = *self.heating.get(&heating)?;
        Some(AppliedFactor {
            kind: FactorKind::Heating,
            key: heating.as_str().to_string(),
            multiplier,
            reason: format!("heating {}", heating.as_str()),
        })
    }

    pub fn legal_factor(&self, status: LegalStatus) -> Option<AppliedFactor> {
        if status == LegalStatus::Unknown {
            return None;
        }
        let multiplier = *self.legal_status.get(&status)?;
        Some(AppliedFactor {
            kind: FactorKind::LegalStatus,
            key: status.as_str().to_string(),
            multiplier,
            reason: format!("legal status {}", status.as_str()),
        })
    }

    pub fn condition_factor(&self, condition: Condition) -> Option<AppliedFactor> {
        if condition == Condition::Unknown {
            return None;
        }
        let multiplier = *self.condition.get(&condition)?;
        Some(AppliedFactor {
            kind: FactorKind::Condition,
            key: condition.as_str().to_string(),
            multiplier,
            reason: format!("condition {}", condition.as_str()),
        })
    }

    pub fn age_factor(&self, band: AgeBand) -> Option<AppliedFactor> {
        let multiplier = *self.building_age.get(&band)?;
        Some(AppliedFactor {
            kind: FactorKind::BuildingAge,
            key: band.as_str().to_string(),
            multiplier,
            reason: format!("building age {}", band.as_str()),
        })
    }

    pub fn parking_factor(&self, parking: Parking) -> Option<AppliedFactor> {
        if parking == Parking::Unknown {
            return None;
        }
        let multiplier = *self.parking.get(&parking)?;
        Some(AppliedFactor {
            kind: FactorKind::Parking,
            key: parking.as_str().to_string(),
            multiplier,
            reason: format!("parking {}", parking.as_str()),
        })
    }

    pub fn extra_factor(&self, extra: Extra) -> Option<AppliedFactor> {
        let multiplier = *self.extras.get(&extra)?;
        Some(AppliedFactor {
            kind: FactorKind::Extra,
            key: extra.as_str().to_string(),
            multiplier,
            reason: format!("has {}", extra.as_str()),
        })
    }
}
