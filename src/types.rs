//! Core types shared by the resolution, pricing, valuation and fraud stages

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Unique key of a scraped listing: (source site id, source listing id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub source: String,
    pub source_listing_id: String,
}

impl ListingKey {
    pub fn new(source: impl Into<String>, source_listing_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_listing_id: source_listing_id.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_listing_id)
    }
}

/// A listing exactly as delivered by a site connector.
///
/// Immutable once stored. A re-scrape produces a new value with the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: String,
    pub source_listing_id: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub floor: Option<String>,
    #[serde(default)]
    pub total_floors: Option<String>,
    #[serde(default)]
    pub heating: Option<String>,
    #[serde(default)]
    pub legal_status: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub latitude: Option<String>,
    #[serde(default)]
    pub longitude: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub image_hashes: Vec<String>,
    #[serde(default)]
    pub urgent: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub parking: Option<String>,
    #[serde(default)]
    pub year_built: Option<String>,
    /// Free-text amenity labels ("terasa", "lift", ...)
    #[serde(default)]
    pub extras: Vec<String>,
}

impl RawListing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.source.clone(), self.source_listing_id.clone())
    }
}

/// Floor position. Negative levels are below ground, 0 is ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Floor {
    Level(i16),
    Top { elevator: bool },
    Unknown,
}

impl Floor {
    /// Category used by the valuation factor table
    pub fn category(&self) -> FloorCategory {
        match *self {
            Floor::Level(n) if n < 0 => FloorCategory::Basement,
            Floor::Level(0) => FloorCategory::Ground,
            Floor::Level(1) => FloorCategory::First,
            Floor::Level(_) => FloorCategory::Middle,
            Floor::Top { elevator: true } => FloorCategory::TopWithElevator,
            Floor::Top { elevator: false } => FloorCategory::TopNoElevator,
            Floor::Unknown => FloorCategory::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Floor::Unknown)
    }

    pub fn level(&self) -> Option<i16> {
        match self {
            Floor::Level(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorCategory {
    Basement,
    Ground,
    First,
    Middle,
    TopWithElevator,
    TopNoElevator,
    Unknown,
}

impl FloorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FloorCategory::Basement => "basement",
            FloorCategory::Ground => "ground",
            FloorCategory::First => "first",
            FloorCategory::Middle => "middle",
            FloorCategory::TopWithElevator => "top_with_elevator",
            FloorCategory::TopNoElevator => "top_no_elevator",
            FloorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingType {
    /// District heating (CG)
    CentralCity,
    /// Building or per-flat central heating (etažno)
    CentralBuilding,
    Gas,
    Electric,
    SolidFuel,
    FloorHeating,
    HeatPump,
    Unknown,
}

impl HeatingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeatingType::CentralCity => "central_city",
            HeatingType::CentralBuilding => "central_building",
            HeatingType::Gas => "gas",
            HeatingType::Electric => "electric",
            HeatingType::SolidFuel => "solid_fuel",
            HeatingType::FloorHeating => "floor_heating",
            HeatingType::HeatPump => "heat_pump",
            HeatingType::Unknown => "unknown",
        }
    }
}

/// Land-registry status of the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LegalStatus {
    #[serde(rename = "uknjizen")]
    Registered,
    #[serde(rename = "u_postupku")]
    InRegistration,
    #[serde(rename = "bez_papira")]
    Unregistered,
    #[serde(rename = "unknown")]
    Unknown,
}

impl LegalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegalStatus::Registered => "uknjizen",
            LegalStatus::InRegistration => "u_postupku",
            LegalStatus::Unregistered => "bez_papira",
            LegalStatus::Unknown => "unknown",
        }
    }
}

/// State of the unit as advertised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Lux,
    Excellent,
    Good,
    NeedsCosmetic,
    NeedsRenovation,
    /// Sold off-plan or still being built
    Construction,
    #[default]
    Unknown,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Lux => "lux",
            Condition::Excellent => "excellent",
            Condition::Good => "good",
            Condition::NeedsCosmetic => "needs_cosmetic",
            Condition::NeedsRenovation => "needs_renovation",
            Condition::Construction => "construction",
            Condition::Unknown => "unknown",
        }
    }

    /// Old buildings in this condition count as renovated
    pub fn is_renovated(&self) -> bool {
        matches!(self, Condition::Lux | Condition::Excellent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parking {
    Garage,
    Spot,
    Street,
    /// Explicitly advertised as having no parking
    None,
    #[default]
    Unknown,
}

impl Parking {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parking::Garage => "garage",
            Parking::Spot => "spot",
            Parking::Street => "street",
            Parking::None => "none",
            Parking::Unknown => "unknown",
        }
    }
}

/// Amenities that each carry their own multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extra {
    Terrace,
    Balcony,
    BasementStorage,
    Elevator,
    Security,
    Garden,
}

impl Extra {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extra::Terrace => "terrace",
            Extra::Balcony => "balcony",
            Extra::BasementStorage => "basement_storage",
            Extra::Elevator => "elevator",
            Extra::Security => "security",
            Extra::Garden => "garden",
        }
    }
}

/// Building age bracket, relative to the valuation date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBand {
    New,
    #[serde(rename = "under_5")]
    Under5,
    #[serde(rename = "5_to_10")]
    FiveToTen,
    #[serde(rename = "10_to_20")]
    TenToTwenty,
    #[serde(rename = "20_to_30")]
    TwentyToThirty,
    #[serde(rename = "over_30_renovated")]
    Over30Renovated,
    #[serde(rename = "over_30_original")]
    Over30Original,
}

impl AgeBand {
    /// Band of a building completed in `year_built`, seen from `current_year`.
    /// Buildings not finished yet are new.
    pub fn of(year_built: i32, current_year: i32, condition: Condition) -> Self {
        match current_year - year_built {
            age if age <= 1 => AgeBand::New,
            age if age < 5 => AgeBand::Under5,
            age if age < 10 => AgeBand::FiveToTen,
            age if age < 20 => AgeBand::TenToTwenty,
            age if age <= 30 => AgeBand::TwentyToThirty,
            _ if condition.is_renovated() => AgeBand::Over30Renovated,
            _ => AgeBand::Over30Original,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBand::New => "new",
            AgeBand::Under5 => "under_5",
            AgeBand::FiveToTen => "5_to_10",
            AgeBand::TenToTwenty => "10_to_20",
            AgeBand::TwentyToThirty => "20_to_30",
            AgeBand::Over30Renovated => "over_30_renovated",
            AgeBand::Over30Original => "over_30_original",
        }
    }
}

/// WGS84 coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    /// Haversine distance in meters
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// Locality a cluster lives in. All resolution candidates share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub city: String,
    pub neighborhood: String,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.city, self.neighborhood)
    }
}

/// Canonical-schema projection of a [`RawListing`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub key: ListingKey,
    pub scraped_at: DateTime<Utc>,
    /// First publication time, falling back to the scrape time
    pub listed_since: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub price_eur: Decimal,
    pub area_m2: Decimal,
    pub rooms: Option<Decimal>,
    pub floor: Floor,
    pub total_floors: Option<i16>,
    pub heating: HeatingType,
    pub legal_status: LegalStatus,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub parking: Parking,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default)]
    pub extras: BTreeSet<Extra>,
    pub city: String,
    pub neighborhood: String,
    pub street: Option<String>,
    pub geo: Option<GeoPoint>,
    pub image_hashes: BTreeSet<String>,
    pub agent_id: Option<String>,
    pub has_phone: bool,
    pub listing_age_days: i64,
    pub urgent: bool,
    /// SHA-256 over the raw content, scrape time excluded
    pub fingerprint: String,
}

impl NormalizedListing {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            city: self.city.clone(),
            neighborhood: self.neighborhood.clone(),
        }
    }

    /// Number of optional attributes that are populated
    pub fn completeness(&self) -> usize {
        [
            self.rooms.is_some(),
            self.floor.is_known(),
            self.total_floors.is_some(),
            self.heating != HeatingType::Unknown,
            self.legal_status != LegalStatus::Unknown,
            self.condition != Condition::Unknown,
            self.parking != Parking::Unknown,
            self.year_built.is_some(),
            self.street.is_some(),
            self.geo.is_some(),
            !self.image_hashes.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// Stable cluster identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ClusterStatus {
    Active,
    /// No member has been confirmed within the staleness window
    Stale,
    /// Absorbed into another cluster; kept as a tombstone
    Merged { into: ClusterId },
    /// Lost a member to a split during the current pass
    Split,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatus::Active => f.write_str("active"),
            ClusterStatus::Stale => f.write_str("stale"),
            ClusterStatus::Merged { into } => write!(f, "merged into {}", into),
            ClusterStatus::Split => f.write_str("split"),
        }
    }
}

/// A cluster member together with its confirmation timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub listing: NormalizedListing,
    pub first_seen: DateTime<Utc>,
    pub last_confirmed: DateTime<Utc>,
}

impl MemberRecord {
    pub fn new(listing: NormalizedListing) -> Self {
        Self {
            first_seen: listing.scraped_at,
            last_confirmed: listing.scraped_at,
            listing,
        }
    }

    /// Days on market, from the earlier of publication and first sighting
    pub fn age_days(&self, as_of: DateTime<Utc>) -> i64 {
        let since = self.listing.listed_since.min(self.first_seen);
        (as_of - since).num_days().max(0)
    }
}

/// One price observation of one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub key: ListingKey,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Attributes describing a cluster as a whole, used for matching and valuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeAttributes {
    /// Member the scalar attributes were taken from
    pub source_key: ListingKey,
    pub area_m2: Decimal,
    pub rooms: Option<Decimal>,
    pub floor: Floor,
    pub total_floors: Option<i16>,
    pub heating: HeatingType,
    pub legal_status: LegalStatus,
    pub street: Option<String>,
    pub geo: Option<GeoPoint>,
    /// Union over all members
    pub image_hashes: BTreeSet<String>,
}

impl From<&NormalizedListing> for RepresentativeAttributes {
    fn from(listing: &NormalizedListing) -> Self {
        Self {
            source_key: listing.key.clone(),
            area_m2: listing.area_m2,
            rooms: listing.rooms,
            floor: listing.floor,
            total_floors: listing.total_floors,
            heating: listing.heating,
            legal_status: listing.legal_status,
            street: listing.street.clone(),
            geo: listing.geo,
            image_hashes: listing.image_hashes.clone(),
        }
    }
}

/// A resolved physical unit aggregating one or more source listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub id: ClusterId,
    pub partition: PartitionKey,
    #[serde(with = "member_list")]
    pub members: BTreeMap<ListingKey, MemberRecord>,
    pub representative: RepresentativeAttributes,
    /// Append-only, ordered by observation time
    pub price_history: Vec<PriceObservation>,
    /// Lowest currently active observed price
    pub current_price: Option<Decimal>,
    pub recommended_price: Option<Decimal>,
    pub status: ClusterStatus,
    /// Incremented on any membership or price change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalProperty {
    /// Create a singleton cluster around one listing
    pub fn singleton(id: ClusterId, listing: NormalizedListing) -> Self {
        let now = listing.scraped_at;
        let representative = RepresentativeAttributes::from(&listing);
        let partition = listing.partition_key();
        let mut members = BTreeMap::new();
        members.insert(listing.key.clone(), MemberRecord::new(listing));

        Self {
            id,
            partition,
            members,
            representative,
            price_history: Vec::new(),
            current_price: None,
            recommended_price: None,
            status: ClusterStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active clusters take part in comparables and fraud indexes
    pub fn is_active(&self) -> bool {
        matches!(self.status, ClusterStatus::Active | ClusterStatus::Split)
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.status, ClusterStatus::Merged { .. })
    }

    pub fn bump_version(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = self.updated_at.max(now);
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.members.keys().any(|k| k.source == source)
    }

    pub fn sources(&self) -> BTreeSet<&str> {
        self.members.keys().map(|k| k.source.as_str()).collect()
    }

    /// Observations belonging to one member
    pub fn history_of<'a>(&'a self, key: &'a ListingKey) -> impl Iterator<Item = &'a PriceObservation> + 'a {
        self.price_history.iter().filter(move |o| &o.key == key)
    }

    /// Insert an observation keeping the history ordered by time
    pub fn insert_observation(&mut self, observation: PriceObservation) {
        let pos = self
            .price_history
            .partition_point(|o| (o.observed_at, &o.key) <= (observation.observed_at, &observation.key));
        self.price_history.insert(pos, observation);
    }

    /// Re-derive representative attributes from the most complete, most recent member
    pub fn recompute_representative(&mut self) {
        let best = self.members.values().max_by(|a, b| {
            a.listing
                .completeness()
                .cmp(&b.listing.completeness())
                .then(a.listing.scraped_at.cmp(&b.listing.scraped_at))
                // lowest key wins a full tie
                .then(b.listing.key.cmp(&a.listing.key))
        });

        if let Some(best) = best {
            let mut representative = RepresentativeAttributes::from(&best.listing);
            representative.image_hashes = self
                .members
                .values()
                .flat_map(|m| m.listing.image_hashes.iter().cloned())
                .collect();
            if representative.geo.is_none() {
                representative.geo = self.members.values().find_map(|m| m.listing.geo);
            }
            self.representative = representative;
        }
    }
}

/// Members serialize as a list; JSON object keys must be strings
mod member_list {
    use super::{ListingKey, MemberRecord};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(members: &BTreeMap<ListingKey, MemberRecord>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(members.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<ListingKey, MemberRecord>, D::Error> {
        let records = Vec::<MemberRecord>::deserialize(d)?;
        Ok(records.into_iter().map(|r| (r.listing.key.clone(), r)).collect())
    }
}
