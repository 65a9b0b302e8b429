//! Configuration for the catalog engines.
//!
//! Every struct has a `Default` holding the tuned constants, and the whole
//! set can be loaded from a JSON file where missing fields keep their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Configuration for snapshot merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MergeConfig {
    /// Two observations of one portal within a batch may differ by this much
    /// before the batch is rejected as ambiguous.
    /// Default: 1.0 meters (coordinates are published with 6 decimals)
    pub position_tolerance_m: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            position_tolerance_m: 1.0,
        }
    }
}

/// One physical size class used while clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub name: String,
    /// Maximum distance between any two members, meters
    pub max_size_m: f64,
}

impl Tier {
    pub fn new(name: impl Into<String>, max_size_m: f64) -> Self {
        Self {
            name: name.into(),
            max_size_m,
        }
    }
}

/// Configuration for donut clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Minimum members for every cluster except the residual one.
    /// Default: 10
    pub min_members: usize,

    /// Tiers ordered from smallest to largest.
    /// Default: walking 500m, biking 2km, driving 5km
    pub tiers: Vec<Tier>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_members: 10,
            tiers: vec![
                Tier::new("walking", 500.0),
                Tier::new("biking", 2_000.0),
                Tier::new("driving", 5_000.0),
            ],
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_members == 0 {
            return Err(invalid("clustering minimum member count must be at least 1"));
        }
        if self.tiers.is_empty() {
            return Err(invalid("clustering needs at least one tier"));
        }
        for tier in &self.tiers {
            if !(tier.max_size_m.is_finite() && tier.max_size_m > 0.0) {
                return Err(invalid(&format!(
                    "tier '{}' has non-positive size {}",
                    tier.name, tier.max_size_m
                )));
            }
        }
        for pair in self.tiers.windows(2) {
            if pair[1].max_size_m <= pair[0].max_size_m {
                return Err(invalid(&format!(
                    "tier '{}' must be larger than tier '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }
        let mut names: Vec<&str> = self.tiers.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.tiers.len() {
            return Err(invalid("tier names must be unique"));
        }
        Ok(())
    }
}

/// Configuration for route optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfig {
    /// Maximum 2-opt improvement passes.
    /// Default: 1000
    pub max_passes: usize,

    /// Wall-clock budget for 2-opt, milliseconds. None = unbounded.
    /// Default: 5000
    pub time_budget_ms: Option<u64>,

    /// Inputs up to this size are solved by exhaustive search.
    /// Default: 8 (40320 permutations)
    pub exhaustive_limit: usize,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            max_passes: 1000,
            time_budget_ms: Some(5_000),
            exhaustive_limit: 8,
        }
    }
}

/// Configuration for the pairwise distance cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DistanceCacheConfig {
    /// Cached measurements older than this are purged, seconds.
    /// Default: 90 days
    pub max_age_secs: i64,

    /// Upstream calls allowed per provider before it is treated as exhausted.
    /// Default: None (unlimited)
    pub max_upstream_calls: Option<usize>,
}

impl Default for DistanceCacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 90 * 24 * 60 * 60,
            max_upstream_calls: None,
        }
    }
}

/// All engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogConfig {
    pub merge: MergeConfig,
    pub clustering: ClusterConfig,
    pub route: RouteConfig,
    pub distance_cache: DistanceCacheConfig,
}

impl CatalogConfig {
    /// Parse a JSON document; absent sections and fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CatalogConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.merge.position_tolerance_m.is_finite() && self.merge.position_tolerance_m >= 0.0) {
            return Err(invalid("merge position tolerance must be a non-negative number"));
        }
        if self.distance_cache.max_age_secs < 0 {
            return Err(invalid("distance cache max age must not be negative"));
        }
        self.clustering.validate()
    }
}

fn invalid(message: &str) -> CatalogError {
    CatalogError::InvalidConfig {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        CatalogConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CatalogConfig::from_json_str(r#"{"clustering": {"minMembers": 4}}"#).unwrap();
        assert_eq!(config.clustering.min_members, 4);
        assert_eq!(config.clustering.tiers.len(), 3);
        assert_eq!(config.route.exhaustive_limit, 8);
    }

    #[test]
    fn test_unsorted_tiers_rejected() {
        let config = ClusterConfig {
            min_members: 10,
            tiers: vec![Tier::new("large", 5000.0), Tier::new("small", 500.0)],
        };
        assert!(matches!(
            config.validate(),
            Err(CatalogError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_zero_minimum_rejected() {
        let config = ClusterConfig {
            min_members: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
