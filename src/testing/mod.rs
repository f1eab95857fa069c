//! Test fixtures for the estate engine
//!
//! Provides:
//! - A fixed reference clock (`day`)
//! - Raw and normalized listing builders
//! - The reference valuation factor table
//! - A seeded generator of multi-source listing batches

pub mod fixtures;
pub mod generators;

pub use fixtures::{day, engine_config, listing, raw_listing, reference_factor_table};
pub use generators::ListingGenerator;
