//! Error types for the engine

use crate::normalize::RejectionReason;
use crate::types::{ClusterId, ListingKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Malformed input {key}: {reason}")]
    MalformedInput {
        key: ListingKey,
        reason: RejectionReason,
    },

    #[error("Ambiguous match for {key}: candidates {candidates:?}")]
    AmbiguousMatch {
        key: ListingKey,
        candidates: Vec<ClusterId>,
    },

    #[error("Stale version for cluster {cluster_id}: expected {expected}, found {found}")]
    StaleVersionConflict {
        cluster_id: ClusterId,
        expected: u64,
        found: u64,
    },

    #[error("Cluster not found: {0}")]
    UnknownCluster(ClusterId),

    #[error("Listing {key} is not a member of cluster {cluster_id}")]
    UnknownMember {
        cluster_id: ClusterId,
        key: ListingKey,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl EngineError {
    /// Fatal errors abort a batch run; everything else is retried or degraded
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
