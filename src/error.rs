//! Unified error handling for the portal catalog.
//!
//! Every engine returns [`CatalogError`]. Transient distance provider failures
//! are represented here too, but the route engine absorbs them and never lets
//! them reach the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Two observations of the same portal in one merge batch disagree on position
    #[error(
        "Portal '{portal_id}' observed at positions {distance_m:.1}m apart in one batch \
         (tolerance {tolerance_m:.1}m); batch aborted"
    )]
    Conflict {
        portal_id: String,
        distance_m: f64,
        tolerance_m: f64,
    },

    /// Distance provider could not answer (network, quota); callers fall back
    #[error("Distance provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// A produced cluster breaks its size or membership contract
    #[error("Cluster '{cluster_id}' violates invariant: {rule}")]
    InvariantViolation { cluster_id: String, rule: String },

    #[error("Portal '{portal_id}' is not in the catalog")]
    UnknownPortal { portal_id: String },

    #[error("Region code '{code}' is not in the catalog")]
    UnknownRegion { code: String },

    #[error("Portal '{portal_id}' has invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates {
        portal_id: String,
        latitude: f64,
        longitude: f64,
    },

    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    #[error("Geometry error: {message}")]
    Geometry { message: String },

    /// Unknown field or malformed value in a portal listing query
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Whether the failure is transient and a degraded answer is acceptable.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::ProviderUnavailable { .. })
    }
}

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Non-fatal notice that a portal was left unpruned pending manual classification.
///
/// `region_code` is `None` when no boundary contains the portal at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnclassifiedRegionWarning {
    pub portal_id: String,
    pub region_code: Option<String>,
}

impl std::fmt::Display for UnclassifiedRegionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.region_code {
            Some(code) => write!(
                f,
                "Portal '{}' is in unclassified region '{}'",
                self.portal_id, code
            ),
            None => write!(f, "Portal '{}' is outside every known region", self.portal_id),
        }
    }
}

/// Extension trait for converting Option to CatalogError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown portal error.
    fn ok_or_unknown_portal(self, portal_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown region error.
    fn ok_or_unknown_region(self, code: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_portal(self, portal_id: &str) -> Result<T> {
        self.ok_or_else(|| CatalogError::UnknownPortal {
            portal_id: portal_id.to_string(),
        })
    }

    fn ok_or_unknown_region(self, code: &str) -> Result<T> {
        self.ok_or_else(|| CatalogError::UnknownRegion {
            code: code.to_string(),
        })
    }
}
