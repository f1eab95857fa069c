//! Seeded generator of realistic multi-source listing batches
//!
//! Each generated unit is a physical flat with its own location, street
//! and photo set. A unit is advertised on one to three sites; the copies
//! differ the way real scrapes do (price formatting, casing, photo subsets)
//! but always share enough evidence to resolve to one property.

use crate::types::RawListing;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const SOURCES: [&str; 3] = ["halooglasi", "nekretnine", "4zida"];
const NEIGHBORHOODS: [&str; 3] = ["Vračar", "Novi Beograd", "Zvezdara"];
const STREETS: [&str; 8] = [
    "Njegoševa",
    "Krunska",
    "Bulevar Mihajla Pupina",
    "Jurija Gagarina",
    "Bulevar kralja Aleksandra",
    "Vojislava Ilića",
    "Maksima Gorkog",
    "Kursulina",
];
const HEATING: [&str; 4] = ["CG", "etažno", "gas", "TA peć"];

/// One physical unit behind the generated listings
#[derive(Debug, Clone)]
pub struct GeneratedUnit {
    pub neighborhood: &'static str,
    pub street: String,
    pub lat: f64,
    pub lon: f64,
    pub area: u32,
    pub rooms: &'static str,
    pub floor: u8,
    pub heating: &'static str,
    pub price: u32,
    pub images: Vec<String>,
}

pub struct ListingGenerator {
    rng: StdRng,
    counter: u32,
}

impl ListingGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            counter: 0,
        }
    }

    /// A fresh unit, placed on a grid so distinct units sit far apart
    pub fn unit(&mut self) -> GeneratedUnit {
        self.counter += 1;
        let n = self.counter;
        let neighborhood = NEIGHBORHOODS[(n as usize) % NEIGHBORHOODS.len()];
        let street = format!("{} {}", STREETS[self.rng.random_range(0..STREETS.len())], n);

        // ~600 m spacing between grid cells
        let lat = 44.78 + f64::from(n % 20) * 0.0055;
        let lon = 20.44 + f64::from(n / 20) * 0.0075;

        let area = self.rng.random_range(38..110);
        let rooms = match area {
            0..=45 => "1,5",
            46..=60 => "2",
            61..=75 => "2,5",
            76..=90 => "3",
            _ => "4",
        };
        let ppm2 = self.rng.random_range(1800..3200);

        GeneratedUnit {
            neighborhood,
            street,
            lat,
            lon,
            area,
            rooms,
            floor: self.rng.random_range(1..6),
            heating: HEATING[self.rng.random_range(0..HEATING.len())],
            price: area * ppm2 / 100 * 100,
            images: (0..4).map(|i| format!("u{:04}-img{}", n, i)).collect(),
        }
    }

    /// The unit as advertised on one source
    pub fn advertise(&mut self, unit: &GeneratedUnit, source: &str, scraped_at: DateTime<Utc>) -> RawListing {
        self.counter += 1;
        let price_jitter = self.rng.random_range(0..4) * 500;
        let price = unit.price + price_jitter;
        let price_text = match self.rng.random_range(0..3) {
            0 => format!("{}.{:03} €", price / 1000, price % 1000),
            1 => format!("{} EUR", price),
            _ => format!("€ {},{:03}", price / 1000, price % 1000),
        };

        // Every copy keeps the first photo, plus a random subset of the rest
        let mut images = vec![unit.images[0].clone()];
        images.extend(unit.images[1..].iter().filter(|_| self.rng.random_bool(0.5)).cloned());

        let street = if self.rng.random_bool(0.5) {
            unit.street.to_uppercase()
        } else {
            unit.street.clone()
        };

        RawListing {
            source: source.to_string(),
            source_listing_id: format!("{}-{}", &source[..2], self.counter),
            scraped_at,
            published_at: Some(scraped_at - Duration::days(self.rng.random_range(0..60))),
            title: format!("Stan {} m2, {}", unit.area, unit.neighborhood),
            description: format!("Stan na {}. spratu", unit.floor),
            price: Some(price_text),
            currency: None,
            area: Some(format!("{} m2", unit.area)),
            rooms: Some(unit.rooms.to_string()),
            floor: Some(format!("{}/6", unit.floor)),
            total_floors: None,
            heating: Some(unit.heating.to_string()),
            legal_status: Some("uknjižen".to_string()),
            city: Some("Beograd".to_string()),
            neighborhood: Some(unit.neighborhood.to_string()),
            street: Some(street),
            latitude: Some(format!("{:.6}", unit.lat + self.rng.random_range(-0.00002..0.00002))),
            longitude: Some(format!("{:.6}", unit.lon + self.rng.random_range(-0.00002..0.00002))),
            agent_id: Some(format!("agent-{}", self.rng.random_range(1..6))),
            agent_name: None,
            phone: Some("064 555 1234".to_string()),
            image_hashes: images,
            urgent: None,
            condition: None,
            parking: None,
            year_built: None,
            extras: Vec::new(),
        }
    }

    /// `units` properties, each on a random subset of sources, shuffled
    pub fn batch(&mut self, units: usize, scraped_at: DateTime<Utc>) -> (Vec<GeneratedUnit>, Vec<RawListing>) {
        let mut generated = Vec::with_capacity(units);
        let mut listings = Vec::new();

        for _ in 0..units {
            let unit = self.unit();
            let copies = self.rng.random_range(1..=SOURCES.len());
            let mut sources = SOURCES.to_vec();
            sources.shuffle(&mut self.rng);
            for source in sources.into_iter().take(copies) {
                listings.push(self.advertise(&unit, source, scraped_at));
            }
            generated.push(unit);
        }

        listings.shuffle(&mut self.rng);
        (generated, listings)
    }

    /// Shuffle a batch with this generator's rng
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}
