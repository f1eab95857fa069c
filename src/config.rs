//! Configuration management
//!
//! Every threshold, weight and table the engine consumes comes from here.
//! Configuration is reloaded between batches; a missing or invalid file
//! aborts the batch instead of falling back to defaults.

use crate::error::{EngineError, Result};
use crate::fraud::RuleName;
use crate::types::{Condition, Extra, HeatingType, LegalStatus, Parking};
use crate::valuation::FactorTable;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub valuation: ValuationConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Synonyms mapping free text onto one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymEntry<T> {
    pub category: T,
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityAlias {
    /// Canonical city name
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Currency code -> EUR per unit
    pub currency_rates: BTreeMap<String, Decimal>,
    /// Currency assumed when neither the field nor the price text names one
    pub default_currency: String,
    pub cities: Vec<CityAlias>,
    pub heating: Vec<SynonymEntry<HeatingType>>,
    pub legal_status: Vec<SynonymEntry<LegalStatus>>,
    pub condition: Vec<SynonymEntry<Condition>>,
    pub parking: Vec<SynonymEntry<Parking>>,
    /// Amenity labels, matched one by one against the listing's extras
    pub extras: Vec<SynonymEntry<Extra>>,
    /// Title phrases that count as an urgency claim
    pub urgency_keywords: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let mut currency_rates = BTreeMap::new();
        currency_rates.insert("EUR".to_string(), dec!(1));
        currency_rates.insert("RSD".to_string(), dec!(0.008547)); // 1 EUR = 117 RSD

        let city = |name: &str, aliases: &[&str]| CityAlias {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        };
        let syn = |aliases: &[&str]| aliases.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        Self {
            currency_rates,
            default_currency: "EUR".to_string(),
            cities: vec![
                city("Beograd", &["beograd", "belgrade", "bg"]),
                city("Novi Sad", &["novi sad", "ns"]),
                city("Novi Pazar", &["novi pazar"]),
                city("Nis", &["nis"]),
                city("Kragujevac", &["kragujevac"]),
                city("Zlatibor", &["zlatibor"]),
            ],
            heating: vec![
                SynonymEntry { category: HeatingType::CentralCity, synonyms: syn(&["cg", "centralno grejanje", "centralno", "daljinsko"]) },
                SynonymEntry { category: HeatingType::CentralBuilding, synonyms: syn(&["etazno", "etazno grejanje"]) },
                SynonymEntry { category: HeatingType::Gas, synonyms: syn(&["gas", "plin", "gasno"]) },
                SynonymEntry { category: HeatingType::Electric, synonyms: syn(&["struja", "ta pec", "elektricno", "klima"]) },
                SynonymEntry { category: HeatingType::SolidFuel, synonyms: syn(&["cvrsto gorivo", "drva", "ugalj", "kaljeva pec"]) },
                SynonymEntry { category: HeatingType::FloorHeating, synonyms: syn(&["podno", "podno grejanje"]) },
                SynonymEntry { category: HeatingType::HeatPump, synonyms: syn(&["toplotna pumpa"]) },
            ],
            legal_status: vec![
                SynonymEntry { category: LegalStatus::Registered, synonyms: syn(&["uknjizen", "uknjizeno", "upisan", "knjizen"]) },
                SynonymEntry { category: LegalStatus::InRegistration, synonyms: syn(&["u postupku", "u procesu uknjizenja", "u toku uknjizenje"]) },
                SynonymEntry { category: LegalStatus::Unregistered, synonyms: syn(&["bez papira", "nije uknjizen", "neuknjizen", "bez dozvole"]) },
            ],
            condition: vec![
                SynonymEntry { category: Condition::Lux, synonyms: syn(&["lux", "luks", "luksuzno", "luksuzan"]) },
                SynonymEntry { category: Condition::Excellent, synonyms: syn(&["odlicno", "odlicno stanje", "renoviran", "renovirano", "novo renoviran"]) },
                SynonymEntry { category: Condition::Good, synonyms: syn(&["dobro", "dobro stanje", "uredan", "useljiv", "izvorno odrzavan"]) },
                SynonymEntry { category: Condition::NeedsCosmetic, synonyms: syn(&["potrebno krecenje", "za osvezavanje", "kozmeticki radovi"]) },
                SynonymEntry { category: Condition::NeedsRenovation, synonyms: syn(&["za renoviranje", "za adaptaciju", "potrebna adaptacija", "staro stanje"]) },
                SynonymEntry { category: Condition::Construction, synonyms: syn(&["u izgradnji", "izgradnja", "gradnja"]) },
            ],
            parking: vec![
                SynonymEntry { category: Parking::Garage, synonyms: syn(&["garaza", "garazno mesto", "garage"]) },
                SynonymEntry { category: Parking::Spot, synonyms: syn(&["parking mesto", "parking", "pm"]) },
                SynonymEntry { category: Parking::Street, synonyms: syn(&["ulica", "na ulici", "javni parking"]) },
                SynonymEntry { category: Parking::None, synonyms: syn(&["nema", "bez parkinga", "ne"]) },
            ],
            extras: vec![
                SynonymEntry { category: Extra::Terrace, synonyms: syn(&["terasa", "terrace"]) },
                SynonymEntry { category: Extra::Balcony, synonyms: syn(&["balkon", "lodja", "balcony"]) },
                SynonymEntry { category: Extra::BasementStorage, synonyms: syn(&["podrum", "ostava", "spajz"]) },
                SynonymEntry { category: Extra::Elevator, synonyms: syn(&["lift", "elevator"]) },
                SynonymEntry { category: Extra::Security, synonyms: syn(&["obezbedjenje", "video nadzor", "portir"]) },
                SynonymEntry { category: Extra::Garden, synonyms: syn(&["basta", "dvoriste", "garden"]) },
            ],
            urgency_keywords: syn(&["hitno", "hitna prodaja"]),
        }
    }
}

/// Relative weights of the similarity components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub geo: f64,
    pub street: f64,
    pub images: f64,
    pub attributes: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            geo: 0.40,
            street: 0.20,
            images: 0.30,
            attributes: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Pre-filter: maximum relative area difference (0.08 = ±8%)
    pub area_tolerance_pct: Decimal,
    /// Pre-filter: maximum room count difference
    pub room_tolerance: Decimal,
    /// Minimum similarity to merge into an existing cluster
    pub merge_threshold: f64,
    /// Top two candidates closer than this are held as ambiguous
    pub ambiguity_margin: f64,
    pub weights: SimilarityWeights,
    /// Lower bound of the image score when any hash is shared
    pub image_overlap_floor: f64,
    /// Distance at which the geo score halves (meters)
    pub geo_scale_m: f64,
    /// Members further apart than this contradict a merge (meters)
    pub split_distance_m: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            area_tolerance_pct: dec!(0.08),
            room_tolerance: dec!(0.5),
            merge_threshold: 0.75,
            ambiguity_margin: 0.05,
            weights: SimilarityWeights::default(),
            image_overlap_floor: 0.6,
            geo_scale_m: 50.0,
            split_distance_m: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Recommended price = lowest active price * (1 - margin)
    pub safety_margin_pct: Decimal,
    /// Members not reconfirmed within this many days are stale
    pub staleness_days: i64,
    /// Minimum relative move of the recommended price that emits an event
    pub delta_threshold_pct: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            safety_margin_pct: dec!(0.05),
            staleness_days: 45,
            delta_threshold_pct: dec!(0.05),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuationConfig {
    /// Below this many neighborhood comparables the search widens to the city
    pub min_comparables: usize,
    /// Comparable area band (0.25 = ±25%)
    pub area_band_pct: Decimal,
    pub room_tolerance: Decimal,
    /// Minimum half-width of the confidence band
    pub base_band_pct: Decimal,
    /// Sample-size term: coefficient / sqrt(n)
    pub size_band_coefficient: Decimal,
    pub max_band_pct: Decimal,
    /// Highest price/m² coefficient of variation still rated high confidence
    pub high_confidence_max_cv: Decimal,
    pub factors: FactorTable,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            min_comparables: 5,
            area_band_pct: dec!(0.25),
            room_tolerance: dec!(0.5),
            base_band_pct: dec!(0.05),
            size_band_coefficient: dec!(0.10),
            max_band_pct: dec!(0.50),
            high_confidence_max_cv: dec!(0.15),
            factors: FactorTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetting {
    /// Maximum contribution of the rule to the composite score
    pub weight: Decimal,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Composite-score cut points; a score at or above a cut point reaches that tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub low: Decimal,
    pub medium: Decimal,
    pub high: Decimal,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low: dec!(0.2),
            medium: dec!(0.4),
            high: dec!(0.7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    pub rules: BTreeMap<RuleName, RuleSetting>,
    pub urgency_min_age_days: i64,
    /// Other active clusters sharing an image hash before the rule fires
    pub duplicate_image_min_clusters: usize,
    pub volatility_min_changes: usize,
    pub volatility_window_days: i64,
    /// Active listings of one agent city-wide before the rule fires
    pub agent_volume_min_listings: usize,
    /// Standard deviations below the comparable median that flag underpricing
    pub underpricing_std_devs: Decimal,
    pub underpricing_min_comparables: usize,
    pub buzzwords: Vec<String>,
    pub overselling_min_buzzwords: usize,
    /// Maximum spread between member prices before the spread rule fires
    pub price_spread_max_pct: Decimal,
    pub tiers: TierThresholds,
}

impl Default for FraudConfig {
    fn default() -> Self {
        let rule = |weight: Decimal| RuleSetting { weight, enabled: true };
        let mut rules = BTreeMap::new();
        rules.insert(RuleName::UrgencyClaim, rule(dec!(0.25)));
        rules.insert(RuleName::DuplicateImage, rule(dec!(0.30)));
        rules.insert(RuleName::PriceVolatility, rule(dec!(0.20)));
        rules.insert(RuleName::AgentVolume, rule(dec!(0.25)));
        rules.insert(RuleName::MissingContact, rule(dec!(0.15)));
        rules.insert(RuleName::UnderpricingOutlier, rule(dec!(0.35)));
        rules.insert(RuleName::Overselling, rule(dec!(0.10)));
        rules.insert(RuleName::CrossSourcePriceSpread, rule(dec!(0.15)));

        Self {
            rules,
            urgency_min_age_days: 30,
            duplicate_image_min_clusters: 2,
            volatility_min_changes: 3,
            volatility_window_days: 30,
            agent_volume_min_listings: 10,
            underpricing_std_devs: dec!(2.0),
            underpricing_min_comparables: 3,
            buzzwords: ["lux", "ekskluziv", "jedinstven", "neponovljiv", "specijal"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
            overselling_min_buzzwords: 2,
            price_spread_max_pct: dec!(0.20),
            tiers: TierThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/estate.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between scheduled passes
    pub batch_interval_secs: u64,
    /// Directory connectors drop JSON / JSONL batches into
    pub inbox_dir: String,
    /// Ingested files are moved here
    pub processed_dir: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            batch_interval_secs: 3600,
            inbox_dir: "data/inbox".to_string(),
            processed_dir: "data/processed".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, with `ESTATE__SECTION__KEY` overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("ESTATE").separator("__"))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.finish()
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.finish()
    }

    /// Load from default locations
    pub fn load_default() -> Result<Self> {
        let paths = ["estate.toml", "config.toml", "~/.config/estate-engine/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        Err(EngineError::Config("no configuration file found".to_string()))
    }

    /// Currency codes are matched upper-case whatever case the source used
    fn finish(mut self) -> Result<Self> {
        self.normalizer.default_currency = self.normalizer.default_currency.to_uppercase();
        self.normalizer.currency_rates = std::mem::take(&mut self.normalizer.currency_rates)
            .into_iter()
            .map(|(code, rate)| (code.to_uppercase(), rate))
            .collect();
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that would corrupt valuations or scores
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::Config(msg));

        if self.valuation.factors.is_empty() {
            return invalid("valuation factor table is missing".to_string());
        }
        if let Some(bad) = self.valuation.factors.values().find(|m| **m <= Decimal::ZERO) {
            return invalid(format!("factor multipliers must be positive, got {}", bad));
        }
        if !self.normalizer.currency_rates.contains_key(&self.normalizer.default_currency) {
            return invalid(format!(
                "default currency {} has no rate",
                self.normalizer.default_currency
            ));
        }

        let r = &self.resolver;
        if !(0.0..=1.0).contains(&r.merge_threshold) || r.merge_threshold == 0.0 {
            return invalid(format!("merge_threshold must be in (0, 1], got {}", r.merge_threshold));
        }
        if !(0.0..1.0).contains(&r.ambiguity_margin) {
            return invalid(format!("ambiguity_margin must be in [0, 1), got {}", r.ambiguity_margin));
        }
        let w = &r.weights;
        if [w.geo, w.street, w.images, w.attributes].iter().any(|x| *x < 0.0)
            || w.geo + w.street + w.images + w.attributes <= 0.0
        {
            return invalid("similarity weights must be non-negative with a positive sum".to_string());
        }

        let p = &self.pricing;
        if p.safety_margin_pct < Decimal::ZERO || p.safety_margin_pct >= Decimal::ONE {
            return invalid(format!("safety_margin_pct must be in [0, 1), got {}", p.safety_margin_pct));
        }
        if p.staleness_days <= 0 {
            return invalid("staleness_days must be positive".to_string());
        }

        if self.valuation.min_comparables == 0 {
            return invalid("min_comparables must be at least 1".to_string());
        }

        let f = &self.fraud;
        if f.rules.is_empty() {
            return invalid("fraud rule table is missing".to_string());
        }
        for (name, setting) in &f.rules {
            if setting.weight < Decimal::ZERO || setting.weight > Decimal::ONE {
                return invalid(format!("weight of {} must be in [0, 1], got {}", name, setting.weight));
            }
        }
        let t = &f.tiers;
        if !(Decimal::ZERO < t.low && t.low < t.medium && t.medium < t.high && t.high <= Decimal::ONE) {
            return invalid(format!(
                "tier thresholds must satisfy 0 < low < medium < high <= 1, got {}/{}/{}",
                t.low, t.medium, t.high
            ));
        }

        Ok(())
    }
}

/// Configuration pinned for the duration of one batch
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub config: Arc<EngineConfig>,
    /// Changes whenever a reload produced a different configuration
    pub generation: u64,
}

/// Hot-reloadable configuration shared by the scheduler and the engine
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: RwLock<Arc<EngineConfig>>,
    generation: AtomicU64,
}

impl ConfigHandle {
    /// Load from a file that will be re-read on every reload
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = EngineConfig::load(path.as_ref())?;
        Ok(Self {
            path: Some(path.as_ref().to_path_buf()),
            current: RwLock::new(Arc::new(config)),
            generation: AtomicU64::new(1),
        })
    }

    /// Wrap a fixed configuration (never reloaded)
    pub fn fixed(config: EngineConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            generation: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let current = self.current.read();
        ConfigSnapshot {
            config: Arc::clone(&current),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Re-read the file. On error the previous configuration stays in place
    /// and the caller must abort the batch.
    pub fn reload(&self) -> Result<u64> {
        let Some(path) = &self.path else {
            return Ok(self.generation());
        };

        let fresh = EngineConfig::load(path)?;
        let mut current = self.current.write();
        if **current != fresh {
            *current = Arc::new(fresh);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!("Configuration reloaded from {} (generation {})", path.display(), generation);
            return Ok(generation);
        }

        Ok(self.generation())
    }

    /// Swap in a new configuration programmatically
    pub fn replace(&self, config: EngineConfig) -> Result<u64> {
        config.validate()?;
        let mut current = self.current.write();
        *current = Arc::new(config);
        Ok(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
