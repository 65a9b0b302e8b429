//! # Boundary Index
//!
//! Point-in-polygon lookup against administrative region boundaries.
//!
//! Region envelopes are bulk loaded into an R-tree once. A lookup first asks
//! the tree for regions whose envelope contains the point, then confirms each
//! candidate with an exact polygon test in dataset order. The index is
//! immutable after construction and can be shared across threads.

use geo::{BoundingRect, Intersects, MultiPolygon};
use geojson::GeoJson;
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};

use crate::error::{CatalogError, Result};
use crate::geo_utils::to_point;
use crate::GeoPoint;

/// Envelope of one region polygon, pointing back into the dataset.
#[derive(Debug, Clone)]
struct RegionEnvelope {
    /// Position in the dataset; earlier regions win overlapping lookups
    idx: usize,
    min_lng: f64,
    min_lat: f64,
    max_lng: f64,
    max_lat: f64,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Immutable spatial index over region boundary polygons.
pub struct BoundaryIndex {
    regions: Vec<(String, MultiPolygon<f64>)>,
    tree: RTree<RegionEnvelope>,
}

impl BoundaryIndex {
    /// Build from `(region code, polygon)` pairs. Coordinates are `x = lng, y = lat`.
    ///
    /// Regions with empty geometry are kept for numbering but can never match.
    pub fn new(regions: Vec<(String, MultiPolygon<f64>)>) -> Self {
        let envelopes: Vec<RegionEnvelope> = regions
            .iter()
            .enumerate()
            .filter_map(|(idx, (code, polygon))| match polygon.bounding_rect() {
                Some(rect) => Some(RegionEnvelope {
                    idx,
                    min_lng: rect.min().x,
                    min_lat: rect.min().y,
                    max_lng: rect.max().x,
                    max_lat: rect.max().y,
                }),
                None => {
                    warn!("[Geocode] Region '{}' has empty geometry, skipping", code);
                    None
                }
            })
            .collect();

        info!(
            "[Geocode] Built boundary index over {} regions",
            envelopes.len()
        );
        Self {
            regions,
            tree: RTree::bulk_load(envelopes),
        }
    }

    /// Parse a GeoJSON FeatureCollection of Polygon/MultiPolygon features,
    /// reading each region code from the `code_property` property.
    ///
    /// String and numeric codes are accepted; features without a code or
    /// with another geometry type are skipped.
    pub fn from_geojson(geojson: &str, code_property: &str) -> Result<Self> {
        let parsed = geojson
            .parse::<GeoJson>()
            .map_err(|e| CatalogError::Geometry {
                message: e.to_string(),
            })?;
        let GeoJson::FeatureCollection(collection) = parsed else {
            return Err(CatalogError::Geometry {
                message: "expected a FeatureCollection".to_string(),
            });
        };

        let mut regions = Vec::with_capacity(collection.features.len());
        for feature in collection.features {
            let code = match feature.property(code_property) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => {
                    debug!(
                        "[Geocode] Skipping feature without '{}' property",
                        code_property
                    );
                    continue;
                }
            };
            let Some(geometry) = feature.geometry else {
                continue;
            };
            let geometry: geo::Geometry<f64> =
                geometry.try_into().map_err(|e: geojson::Error| CatalogError::Geometry {
                    message: format!("region '{}': {}", code, e),
                })?;
            let polygon = match geometry {
                geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                geo::Geometry::MultiPolygon(mp) => mp,
                _ => {
                    debug!("[Geocode] Region '{}' is not a polygon, skipping", code);
                    continue;
                }
            };
            regions.push((code, polygon));
        }

        Ok(Self::new(regions))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region code containing the point, or None outside every region.
    ///
    /// Points on a boundary count as inside. When regions overlap, the one
    /// listed first in the dataset wins, so the answer is stable across runs.
    pub fn lookup(&self, point: &GeoPoint) -> Option<&str> {
        let query = [point.longitude, point.latitude];
        let mut candidates: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point(query))
            .map(|e| e.idx)
            .collect();
        candidates.sort_unstable();

        let target = to_point(point);
        candidates.into_iter().find_map(|idx| {
            let (code, polygon) = &self.regions[idx];
            polygon.intersects(&target).then_some(code.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Polygon};

    fn square(min_lng: f64, min_lat: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: min_lng, y: min_lat),
            (x: min_lng + size, y: min_lat),
            (x: min_lng + size, y: min_lat + size),
            (x: min_lng, y: min_lat + size),
            (x: min_lng, y: min_lat),
        ]
    }

    fn index() -> BoundaryIndex {
        BoundaryIndex::new(vec![
            ("west".to_string(), MultiPolygon::new(vec![square(0.0, 0.0, 1.0)])),
            ("east".to_string(), MultiPolygon::new(vec![square(1.0, 0.0, 1.0)])),
            // Triangle whose envelope covers (2.9, 0.9) but whose area does not
            (
                "tri".to_string(),
                MultiPolygon::new(vec![polygon![
                    (x: 2.0, y: 0.0),
                    (x: 3.0, y: 0.0),
                    (x: 2.0, y: 1.0),
                    (x: 2.0, y: 0.0),
                ]]),
            ),
        ])
    }

    #[test]
    fn test_lookup_inside() {
        let idx = index();
        assert_eq!(idx.lookup(&GeoPoint::new(0.5, 0.5)), Some("west"));
        assert_eq!(idx.lookup(&GeoPoint::new(0.5, 1.5)), Some("east"));
        assert_eq!(idx.lookup(&GeoPoint::new(0.1, 2.1)), Some("tri"));
    }

    #[test]
    fn test_envelope_hit_polygon_miss() {
        assert_eq!(index().lookup(&GeoPoint::new(0.9, 2.9)), None);
    }

    #[test]
    fn test_outside_everything() {
        assert_eq!(index().lookup(&GeoPoint::new(-5.0, -5.0)), None);
    }

    #[test]
    fn test_shared_edge_goes_to_first_region() {
        let idx = index();
        for _ in 0..3 {
            assert_eq!(idx.lookup(&GeoPoint::new(0.5, 1.0)), Some("west"));
        }
    }

    #[test]
    fn test_from_geojson() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"ZCTA5CE10": "62701"},
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]
                    }
                },
                {
                    "type": "Feature",
                    "properties": {"ZCTA5CE10": 62702},
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [[[[2,0],[3,0],[3,1],[2,1],[2,0]]]]
                    }
                },
                {
                    "type": "Feature",
                    "properties": {},
                    "geometry": {"type": "Point", "coordinates": [5, 5]}
                }
            ]
        }"#;
        let idx = BoundaryIndex::from_geojson(json, "ZCTA5CE10").unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.lookup(&GeoPoint::new(0.5, 0.5)), Some("62701"));
        assert_eq!(idx.lookup(&GeoPoint::new(0.5, 2.5)), Some("62702"));
    }

    #[test]
    fn test_from_geojson_rejects_non_collection() {
        let json = r#"{"type": "Point", "coordinates": [0, 0]}"#;
        assert!(matches!(
            BoundaryIndex::from_geojson(json, "code"),
            Err(CatalogError::Geometry { .. })
        ));
    }
}
