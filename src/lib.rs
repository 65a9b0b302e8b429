//! # Portal Catalog
//!
//! Persisted catalog of geographic points of interest ("portals") harvested
//! from exported snapshot files.
//!
//! This library provides:
//! - Deduplicating snapshot merge with first/last seen provenance
//! - Region geocoding through an R-tree boundary index, and pruning
//! - Size-bounded "donut" clustering over tiers of physical size
//! - Route ordering (nearest-neighbour + 2-opt) over a pluggable distance provider
//! - Filtered portal listings, drawn-area trimming and focal-distance grouping
//!
//! ## Features
//!
//! - **`parallel`** - Geocode portals in parallel with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use portal_catalog::{Catalog, CatalogConfig, PortalRecord, Snapshot};
//!
//! let mut catalog = Catalog::in_memory(CatalogConfig::default()).unwrap();
//! let snapshot = Snapshot::new(
//!     1_700_000_000,
//!     vec![
//!         PortalRecord::new("a.16", "Mural", 40.0, -75.0),
//!         PortalRecord::new("b.16", "Fountain", 40.001, -75.0),
//!     ],
//! );
//! let report = catalog.ingest(&[snapshot]).unwrap();
//! assert_eq!(report.created.len(), 2);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CatalogError, OptionExt, Result, UnclassifiedRegionWarning};

pub mod config;
pub use config::{CatalogConfig, ClusterConfig, DistanceCacheConfig, MergeConfig, RouteConfig, Tier};

// Geographic utilities (distance, center, local projection)
pub mod geo_utils;

pub mod types;
pub use types::{Classification, Cluster, Portal, Region, RegionFilter};

// SQLite-backed store with scoped transactions
pub mod store;
pub use store::{PortalStore, StoreRead, StoreTransaction};

pub mod ingest;
pub use ingest::{expunge, merge_snapshots, reconcile, MergeReport, Observation, PortalRecord, Snapshot};

pub mod boundary;
pub use boundary::BoundaryIndex;

pub mod geocode;
pub use geocode::{geocode, prune, trim_bookmarks, GeocodeReport, PruneMode, PruneReport};

pub mod clustering;
pub use clustering::{cluster_portals, donuts, ellipse_groups, EllipseGroup};

pub mod distance;
pub use distance::{
    CachingProvider, Confidence, DistanceCache, DistanceEntry, DistanceProvider, PortalPair,
    StraightLineProvider,
};

pub mod route;
pub use route::{optimize_route, Route};

pub mod query;
pub use query::{show, FieldValue, FilterOp, PortalField, PortalGroup, PortalQuery, ShowReport, SortOrder};

pub mod bookmarks;
pub mod drawtools;
pub use drawtools::{DrawItem, Drawing, LatLng};
pub mod export;
pub use export::{sample_portals, BookmarksSink, DrawShape, DrawtoolsSink, ExportSink};

pub mod catalog;
pub use catalog::Catalog;

/// A WGS84 position.
///
/// # Example
/// ```
/// use portal_catalog::GeoPoint;
/// let point = GeoPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}
