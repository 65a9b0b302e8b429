//! Entity model for the catalog: portals, region classifications and clusters.
//!
//! Positions and invariants are enforced by the engines that mutate these
//! records; the store only persists them.

use serde::{Deserialize, Serialize};

use crate::GeoPoint;

// ============================================================================
// Region classification
// ============================================================================

/// Operator decision on whether portals in a region are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Keep,
    Discard,
    Unclassified,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Keep => "keep",
            Classification::Discard => "discard",
            Classification::Unclassified => "unclassified",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "keep" => Some(Classification::Keep),
            "discard" => Some(Classification::Discard),
            "unclassified" => Some(Classification::Unclassified),
            _ => None,
        }
    }
}

/// An administrative region code and its operator-maintained classification.
///
/// The polygon geometry lives in the [`crate::BoundaryIndex`]; this record is
/// the editable side of the region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub code: String,
    pub classification: Classification,
    /// Human readable name, e.g. "Springfield, IL"
    pub label: Option<String>,
}

impl Region {
    /// A newly discovered region awaiting operator review.
    pub fn unclassified(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            classification: Classification::Unclassified,
            label: None,
        }
    }
}

/// Filter for listing region codes. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RegionFilter {
    pub code: Option<String>,
    pub label: Option<String>,
    pub classification: Option<Classification>,
}

impl RegionFilter {
    pub fn matches(&self, region: &Region) -> bool {
        self.code.as_ref().map_or(true, |c| *c == region.code)
            && self
                .label
                .as_ref()
                .map_or(true, |l| region.label.as_deref() == Some(l.as_str()))
            && self
                .classification
                .map_or(true, |c| c == region.classification)
    }
}

// ============================================================================
// Portal
// ============================================================================

/// A persisted point of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portal {
    /// Stable external identifier
    pub id: String,
    pub name: String,
    pub position: GeoPoint,
    /// Unix timestamp (seconds) of the earliest snapshot containing this portal
    pub first_seen: i64,
    /// Unix timestamp (seconds) of the latest snapshot containing this portal
    pub last_seen: i64,
    /// Containing region, None until geocoded or when outside every region
    pub region_code: Option<String>,
    /// Inclusion mirrored from the region classification, None until geocoded
    pub inclusion: Option<Classification>,
    pub cluster_id: Option<String>,
}

impl Portal {
    /// A portal seen for the first time at `observed_at`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        position: GeoPoint,
        observed_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position,
            first_seen: observed_at,
            last_seen: observed_at,
            region_code: None,
            inclusion: None,
            cluster_id: None,
        }
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// A size-bounded group of geographically close portals ("donut").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// `"{tier}:{leader_id}"`
    pub id: String,
    /// Name of the tier the cluster was formed in
    pub tier: String,
    /// Leftovers after the largest tier; exempt from the minimum member count
    pub residual: bool,
    /// Member portal ids in the order they were absorbed
    pub member_ids: Vec<String>,
    pub centroid: GeoPoint,
    /// Largest pairwise distance between members in meters
    pub bounding_size_m: f64,
    /// Member nearest the centroid
    pub leader_id: String,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}
