//! Listing normalization
//!
//! Converts heterogeneous scraped records into the canonical schema:
//! - Price parsing and currency conversion to EUR
//! - Area, room and floor parsing tolerant of local notation
//! - Heating, legal-status, condition, parking and amenity mapping through
//!   synonym tables
//! - City resolution through an alias table
//!
//! Normalization is a pure function of the record, the configuration and
//! the reference time, so batches can be normalized in parallel.

pub mod parse;


use crate::config::NormalizerConfig;
use crate::types::{Condition, Extra, Floor, HeatingType, LegalStatus, ListingKey, NormalizedListing, Parking, RawListing};
use chrono::{DateTime, Utc};
use parse::NumberStyle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Why a record could not be normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MalformedPrice,
    MissingArea,
    UnresolvableCity,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectionReason::MalformedPrice => "malformed price",
            RejectionReason::MissingArea => "missing area",
            RejectionReason::UnresolvableCity => "unresolvable city",
        };
        f.write_str(text)
    }
}

/// A quarantined record with the reason it was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub key: ListingKey,
    pub reason: RejectionReason,
    pub detail: String,
    pub raw: RawListing,
}

impl Rejection {
    fn new(raw: &RawListing, reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            key: raw.key(),
            reason,
            detail: detail.into(),
            raw: raw.clone(),
        }
    }
}

/// Folded synonym -> category, longest synonym first
struct SynonymTable<T> {
    entries: Vec<(String, T)>,
    unknown: T,
}

impl<T: Copy> SynonymTable<T> {
    fn new(entries: impl IntoIterator<Item = (String, T)>, unknown: T) -> Self {
        let mut entries: Vec<(String, T)> = entries
            .into_iter()
            .map(|(s, c)| (parse::fold(&s), c))
            .filter(|(s, _)| !s.is_empty())
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(&b.0)));
        Self { entries, unknown }
    }

    /// Exact match first, then the longest synonym contained as a word run
    fn lookup(&self, text: Option<&str>) -> T {
        let Some(folded) = text.map(parse::fold).filter(|t| !t.is_empty()) else {
            return self.unknown;
        };
        if let Some((_, category)) = self.entries.iter().find(|(s, _)| *s == folded) {
            return *category;
        }
        let padded = format!(" {} ", folded.replace(|c: char| !c.is_alphanumeric(), " "));
        self.entries
            .iter()
            .find(|(s, _)| padded.contains(&format!(" {} ", s)))
            .map(|(_, c)| *c)
            .unwrap_or(self.unknown)
    }
}

/// Stateless normalizer built from one configuration snapshot
pub struct Normalizer {
    config: NormalizerConfig,
    heating: SynonymTable<HeatingType>,
    legal: SynonymTable<LegalStatus>,
    condition: SynonymTable<Condition>,
    parking: SynonymTable<Parking>,
    extras: SynonymTable<Option<Extra>>,
    cities: Vec<(String, String)>,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        let heating = SynonymTable::new(
            config
                .heating
                .iter()
                .flat_map(|e| e.synonyms.iter().map(move |s| (s.clone(), e.category))),
            HeatingType::Unknown,
        );
        let legal = SynonymTable::new(
            config
                .legal_status
                .iter()
                .flat_map(|e| e.synonyms.iter().map(move |s| (s.clone(), e.category))),
            LegalStatus::Unknown,
        );
        let condition = SynonymTable::new(
            config
                .condition
                .iter()
                .flat_map(|e| e.synonyms.iter().map(move |s| (s.clone(), e.category))),
            Condition::Unknown,
        );
        let parking = SynonymTable::new(
            config
                .parking
                .iter()
                .flat_map(|e| e.synonyms.iter().map(move |s| (s.clone(), e.category))),
            Parking::Unknown,
        );
        let extras = SynonymTable::new(
            config
                .extras
                .iter()
                .flat_map(|e| e.synonyms.iter().map(move |s| (s.clone(), Some(e.category)))),
            None,
        );
        let cities = config
            .cities
            .iter()
            .flat_map(|c| {
                std::iter::once(c.name.clone())
                    .chain(c.aliases.iter().cloned())
                    .map(move |alias| (parse::fold(&alias), c.name.clone()))
            })
            .collect();

        Self {
            config,
            heating,
            legal,
            condition,
            parking,
            extras,
            cities,
        }
    }

    /// Normalize one record against the reference time `as_of`
    pub fn normalize(&self, raw: &RawListing, as_of: DateTime<Utc>) -> Result<NormalizedListing, Rejection> {
        let price_eur = self.price_eur(raw)?;

        let area_m2 = raw
            .area
            .as_deref()
            .and_then(|a| parse::parse_number(a, NumberStyle::Measure))
            .filter(|a| *a > Decimal::ZERO)
            .ok_or_else(|| {
                Rejection::new(raw, RejectionReason::MissingArea, raw.area.clone().unwrap_or_default())
            })?;

        let city = self.resolve_city(raw.city.as_deref()).ok_or_else(|| {
            Rejection::new(raw, RejectionReason::UnresolvableCity, raw.city.clone().unwrap_or_default())
        })?;

        let (floor, total_floors) = match raw.floor.as_deref() {
            Some(text) => parse::parse_floor(text, raw.total_floors.as_deref()),
            None => (
                Floor::Unknown,
                raw.total_floors.as_deref().and_then(|t| parse::parse_floor(t, None).0.level()),
            ),
        };

        let title = parse::collapse_whitespace(&raw.title);
        let folded_title = parse::fold(&raw.title);
        let urgent = raw.urgent.as_deref().map(parse::is_truthy).unwrap_or(false)
            || self
                .config
                .urgency_keywords
                .iter()
                .any(|k| folded_title.contains(&parse::fold(k)));

        let listed_since = raw.published_at.unwrap_or(raw.scraped_at).min(raw.scraped_at);
        let agent_id = raw
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .or_else(|| raw.agent_name.as_deref().map(parse::fold).filter(|a| !a.is_empty()));

        Ok(NormalizedListing {
            key: raw.key(),
            scraped_at: raw.scraped_at,
            listed_since,
            title,
            description: parse::collapse_whitespace(&raw.description),
            price_eur,
            area_m2,
            rooms: raw.rooms.as_deref().and_then(parse::parse_rooms),
            floor,
            total_floors,
            heating: self.heating.lookup(raw.heating.as_deref()),
            legal_status: self.legal.lookup(raw.legal_status.as_deref()),
            condition: self.condition.lookup(raw.condition.as_deref()),
            parking: self.parking.lookup(raw.parking.as_deref()),
            year_built: raw.year_built.as_deref().and_then(|y| parse::parse_year(y, as_of)),
            extras: raw
                .extras
                .iter()
                .filter_map(|e| self.extras.lookup(Some(e.as_str())))
                .collect(),
            city,
            neighborhood: raw.neighborhood.as_deref().map(parse::fold).unwrap_or_default(),
            street: raw.street.as_deref().map(parse::fold).filter(|s| !s.is_empty()),
            geo: parse::parse_geo(raw.latitude.as_deref(), raw.longitude.as_deref()),
            image_hashes: raw
                .image_hashes
                .iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect::<BTreeSet<_>>(),
            agent_id,
            has_phone: parse::has_phone(raw.phone.as_deref()),
            listing_age_days: (as_of - listed_since).num_days().max(0),
            urgent,
            fingerprint: fingerprint(raw),
        })
    }

    /// Normalize a batch, splitting accepted listings from quarantined ones
    pub fn normalize_batch(
        &self,
        raws: &[RawListing],
        as_of: DateTime<Utc>,
    ) -> (Vec<NormalizedListing>, Vec<Rejection>) {
        let mut accepted = Vec::with_capacity(raws.len());
        let mut rejected = Vec::new();

        for raw in raws {
            match self.normalize(raw, as_of) {
                Ok(listing) => accepted.push(listing),
                Err(rejection) => {
                    tracing::warn!(
                        "Quarantined {}: {} ({})",
                        rejection.key,
                        rejection.reason,
                        rejection.detail
                    );
                    rejected.push(rejection);
                }
            }
        }

        (accepted, rejected)
    }

    fn price_eur(&self, raw: &RawListing) -> Result<Decimal, Rejection> {
        let text = raw.price.as_deref().unwrap_or_default();
        let amount = parse::parse_number(text, NumberStyle::Price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| Rejection::new(raw, RejectionReason::MalformedPrice, text))?;

        let currency = parse::detect_currency(text, raw.currency.as_deref())
            .unwrap_or_else(|| self.config.default_currency.clone());
        let rate = self.config.currency_rates.get(&currency).ok_or_else(|| {
            Rejection::new(raw, RejectionReason::MalformedPrice, format!("no rate for {}", currency))
        })?;

        Ok((amount * rate).round_dp(2))
    }

    fn resolve_city(&self, text: Option<&str>) -> Option<String> {
        let folded = text.map(parse::fold).filter(|c| !c.is_empty())?;
        if self.cities.is_empty() {
            return Some(parse::collapse_whitespace(text?.trim()));
        }
        self.cities
            .iter()
            .find(|(alias, _)| *alias == folded)
            .map(|(_, name)| name.clone())
    }
}

/// SHA-256 over every content field of the record; the scrape time is left
/// out so an unchanged re-scrape hashes identically.
pub fn fingerprint(raw: &RawListing) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update(value.as_bytes());
        hasher.update([0x1f]);
    };

    field(&raw.source);
    field(&raw.source_listing_id);
    field(&raw.published_at.map(|p| p.to_rfc3339()).unwrap_or_default());
    field(&raw.title);
    field(&raw.description);
    for text in [
        &raw.price,
        &raw.currency,
        &raw.area,
        &raw.rooms,
        &raw.floor,
        &raw.total_floors,
        &raw.heating,
        &raw.legal_status,
        &raw.city,
        &raw.neighborhood,
        &raw.street,
        &raw.latitude,
        &raw.longitude,
        &raw.agent_id,
        &raw.agent_name,
        &raw.phone,
        &raw.urgent,
        &raw.condition,
        &raw.parking,
        &raw.year_built,
    ] {
        field(text.as_deref().unwrap_or("\u{0}"));
    }
    for hash in &raw.image_hashes {
        field(hash);
    }
    for extra in &raw.extras {
        field(extra);
    }

    hex::encode(hasher.finalize())
}
