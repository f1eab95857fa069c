//! Property Resolution & Valuation Engine
//!
//! Turns raw marketplace listings into canonical properties: listings are
//! normalized, resolved into clusters across sources, priced, valued
//! against comparables and scored for fraud risk, once per batch.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fraud;
pub mod normalize;
pub mod pricing;
pub mod resolve;
pub mod storage;
pub mod testing;
pub mod types;
pub mod valuation;


pub use engine::{BatchOutput, Engine};
pub use error::{EngineError, Result};
