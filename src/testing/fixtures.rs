//! Listing and configuration fixtures

use crate::config::{
    DatabaseConfig, EngineConfig, FraudConfig, NormalizerConfig, PricingConfig, ResolverConfig, ScheduleConfig,
    ValuationConfig,
};
use crate::types::{
    AgeBand, Condition, Extra, Floor, FloorCategory, GeoPoint, HeatingType, LegalStatus, ListingKey, NormalizedListing,
    Parking, RawListing,
};
use crate::valuation::FactorTable;
use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;
use std::collections::BTreeSet;

/// 2026-01-01T00:00:00Z
const REFERENCE_EPOCH: i64 = 1_767_225_600;

/// Reference clock: midnight UTC, `n` days after 2026-01-01
pub fn day(n: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(REFERENCE_EPOCH, 0).expect("reference epoch is a valid timestamp") + Duration::days(n)
}

/// A complete scraped record of a three-room flat on Vračar
pub fn raw_listing(source: &str, id: &str, scraped_at: DateTime<Utc>) -> RawListing {
    RawListing {
        source: source.to_string(),
        source_listing_id: id.to_string(),
        scraped_at,
        published_at: None,
        title: "Trosoban stan, Vračar".to_string(),
        description: "Renoviran stan u blizini Hrama.".to_string(),
        price: Some("125.000 €".to_string()),
        currency: None,
        area: Some("65 m2".to_string()),
        rooms: Some("2,5".to_string()),
        floor: Some("III/5".to_string()),
        total_floors: None,
        heating: Some("CG".to_string()),
        legal_status: Some("Uknjižen".to_string()),
        city: Some("Beograd".to_string()),
        neighborhood: Some("Vračar".to_string()),
        street: Some("Njegoševa 12".to_string()),
        latitude: Some("44.8005".to_string()),
        longitude: Some("20.4780".to_string()),
        agent_id: Some("agent-1".to_string()),
        agent_name: None,
        phone: Some("+381 64 123 4567".to_string()),
        image_hashes: vec!["img-a".to_string(), "img-b".to_string()],
        urgent: None,
        condition: None,
        parking: None,
        year_built: None,
        extras: Vec::new(),
    }
}

/// The normalized form of [`raw_listing`], built directly
pub fn listing(source: &str, id: &str, scraped_at: DateTime<Utc>) -> NormalizedListing {
    NormalizedListing {
        key: ListingKey::new(source, id),
        scraped_at,
        listed_since: scraped_at,
        title: "Trosoban stan, Vračar".to_string(),
        description: "Renoviran stan u blizini Hrama.".to_string(),
        price_eur: dec!(125000),
        area_m2: dec!(65),
        rooms: Some(dec!(2.5)),
        floor: Floor::Level(3),
        total_floors: Some(5),
        heating: HeatingType::CentralCity,
        legal_status: LegalStatus::Registered,
        condition: Condition::Unknown,
        parking: Parking::Unknown,
        year_built: None,
        extras: BTreeSet::new(),
        city: "Beograd".to_string(),
        neighborhood: "vracar".to_string(),
        street: Some("njegoseva 12".to_string()),
        geo: Some(GeoPoint {
            lat: 44.8005,
            lon: 20.4780,
        }),
        image_hashes: ["img-a", "img-b"].iter().map(|h| h.to_string()).collect(),
        agent_id: Some("agent-1".to_string()),
        has_phone: true,
        listing_age_days: 0,
        urgent: false,
        fingerprint: format!("fp-{}-{}", source, id),
    }
}

/// Multipliers used by the reference deployment
pub fn reference_factor_table() -> FactorTable {
    let mut table = FactorTable::default();

    for (name, multiplier) in [
        ("dedinje", dec!(1.35)),
        ("senjak", dec!(1.30)),
        ("vracar", dec!(1.15)),
        ("stari grad", dec!(1.15)),
        ("savski venac", dec!(1.10)),
        ("novi beograd", dec!(1.00)),
        ("zvezdara", dec!(0.92)),
        ("zemun", dec!(0.95)),
        ("palilula", dec!(0.90)),
        ("rakovica", dec!(0.80)),
    ] {
        table.neighborhood.insert(name.to_string(), multiplier);
    }

    table.floor.insert(FloorCategory::Basement, dec!(0.70));
    table.floor.insert(FloorCategory::Ground, dec!(0.85));
    table.floor.insert(FloorCategory::First, dec!(1.05));
    table.floor.insert(FloorCategory::Middle, dec!(1.00));
    table.floor.insert(FloorCategory::TopWithElevator, dec!(0.95));
    table.floor.insert(FloorCategory::TopNoElevator, dec!(0.85));

    table.heating.insert(HeatingType::CentralCity, dec!(1.05));
    table.heating.insert(HeatingType::CentralBuilding, dec!(1.00));
    table.heating.insert(HeatingType::Gas, dec!(0.98));
    table.heating.insert(HeatingType::Electric, dec!(0.85));
    table.heating.insert(HeatingType::SolidFuel, dec!(0.80));
    table.heating.insert(HeatingType::FloorHeating, dec!(1.10));
    table.heating.insert(HeatingType::HeatPump, dec!(1.05));

    table.legal_status.insert(LegalStatus::Registered, dec!(1.00));
    table.legal_status.insert(LegalStatus::InRegistration, dec!(0.90));
    table.legal_status.insert(LegalStatus::Unregistered, dec!(0.70));

    table.condition.insert(Condition::Lux, dec!(1.20));
    table.condition.insert(Condition::Excellent, dec!(1.10));
    table.condition.insert(Condition::Good, dec!(1.00));
    table.condition.insert(Condition::NeedsCosmetic, dec!(0.90));
    table.condition.insert(Condition::NeedsRenovation, dec!(0.75));
    table.condition.insert(Condition::Construction, dec!(1.05));

    table.building_age.insert(AgeBand::New, dec!(1.15));
    table.building_age.insert(AgeBand::Under5, dec!(1.10));
    table.building_age.insert(AgeBand::FiveToTen, dec!(1.00));
    table.building_age.insert(AgeBand::TenToTwenty, dec!(0.90));
    table.building_age.insert(AgeBand::TwentyToThirty, dec!(0.85));
    table.building_age.insert(AgeBand::Over30Renovated, dec!(0.95));
    table.building_age.insert(AgeBand::Over30Original, dec!(0.75));

    table.parking.insert(Parking::Garage, dec!(1.10));
    table.parking.insert(Parking::Spot, dec!(1.05));
    table.parking.insert(Parking::Street, dec!(1.00));
    table.parking.insert(Parking::None, dec!(0.95));

    table.extras.insert(Extra::Terrace, dec!(1.05));
    table.extras.insert(Extra::Balcony, dec!(1.02));
    table.extras.insert(Extra::BasementStorage, dec!(1.03));
    table.extras.insert(Extra::Elevator, dec!(1.05));
    table.extras.insert(Extra::Security, dec!(1.05));
    table.extras.insert(Extra::Garden, dec!(1.08));

    table
}

/// Default configuration with the reference factor table
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        normalizer: NormalizerConfig::default(),
        resolver: ResolverConfig::default(),
        pricing: PricingConfig::default(),
        valuation: ValuationConfig {
            factors: reference_factor_table(),
            ..ValuationConfig::default()
        },
        fraud: FraudConfig::default(),
        database: DatabaseConfig::default(),
        schedule: ScheduleConfig::default(),
    }
}
