//! IITC drawtools files.
//!
//! A drawtools file is a JSON list of shapes tagged by `type`. The catalog
//! writes polylines and polygons (see [`crate::export::DrawtoolsSink`]) and
//! reads drawn areas and markers back: polygons and circles bound an area for
//! trimming, markers and circle centres are foci for ellipse grouping.

use std::path::Path;

use geo::{Destination, Haversine, LineString, MultiPolygon, Polygon};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::geo_utils::to_point;
use crate::GeoPoint;

/// Bearing step when turning a drawn circle into a polygon, degrees.
const CIRCLE_STEP_DEG: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        GeoPoint::new(ll.lat, ll.lng)
    }
}

impl From<GeoPoint> for LatLng {
    fn from(p: GeoPoint) -> Self {
        LatLng {
            lat: p.latitude,
            lng: p.longitude,
        }
    }
}

/// One drawtools shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DrawItem {
    Polygon {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(rename = "latLngs")]
        lat_lngs: Vec<LatLng>,
    },
    Polyline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(rename = "latLngs")]
        lat_lngs: Vec<LatLng>,
    },
    Circle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(rename = "latLng")]
        lat_lng: LatLng,
        /// Meters
        radius: f64,
    },
    Marker {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(rename = "latLng")]
        lat_lng: LatLng,
    },
}

impl DrawItem {
    pub fn kind(&self) -> &'static str {
        match self {
            DrawItem::Polygon { .. } => "polygon",
            DrawItem::Polyline { .. } => "polyline",
            DrawItem::Circle { .. } => "circle",
            DrawItem::Marker { .. } => "marker",
        }
    }

    pub fn color(&self) -> Option<&str> {
        match self {
            DrawItem::Polygon { color, .. }
            | DrawItem::Polyline { color, .. }
            | DrawItem::Circle { color, .. }
            | DrawItem::Marker { color, .. } => color.as_deref(),
        }
    }

    /// Vertices for paths and polygons, the single position otherwise.
    pub fn lat_lngs(&self) -> &[LatLng] {
        match self {
            DrawItem::Polygon { lat_lngs, .. } | DrawItem::Polyline { lat_lngs, .. } => lat_lngs,
            DrawItem::Circle { lat_lng, .. } | DrawItem::Marker { lat_lng, .. } => {
                std::slice::from_ref(lat_lng)
            }
        }
    }

    /// Area enclosed by the shape; None for paths and markers.
    fn area(&self) -> Option<Polygon<f64>> {
        match self {
            DrawItem::Polygon { lat_lngs, .. } => {
                let ring: LineString<f64> = lat_lngs
                    .iter()
                    .map(|ll| (ll.lng, ll.lat))
                    .collect::<Vec<_>>()
                    .into();
                Some(Polygon::new(ring, vec![]))
            }
            DrawItem::Circle { lat_lng, radius, .. } => {
                let center = to_point(&GeoPoint::from(*lat_lng));
                let ring: LineString<f64> = (0..360)
                    .step_by(CIRCLE_STEP_DEG)
                    .map(|bearing| Haversine::destination(center, bearing as f64, *radius))
                    .collect::<Vec<_>>()
                    .into();
                Some(Polygon::new(ring, vec![]))
            }
            DrawItem::Polyline { .. } | DrawItem::Marker { .. } => None,
        }
    }
}

/// Parsed contents of a drawtools file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Drawing {
    pub items: Vec<DrawItem>,
}

impl Drawing {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let drawing = Self::from_json_str(&std::fs::read_to_string(path.as_ref())?)?;
        debug!(
            "[Drawtools] Loaded {} items from {}",
            drawing.items.len(),
            path.as_ref().display()
        );
        Ok(drawing)
    }

    /// Union of every drawn polygon and circle.
    ///
    /// Fails with [`CatalogError::Geometry`] on paths or markers, which bound
    /// no area, and on a drawing with no shapes at all.
    pub fn area(&self) -> Result<MultiPolygon<f64>> {
        let polygons = self
            .items
            .iter()
            .map(|item| {
                item.area().ok_or_else(|| CatalogError::Geometry {
                    message: format!("drawtools {} does not bound an area", item.kind()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if polygons.is_empty() {
            return Err(CatalogError::Geometry {
                message: "drawing has no polygons or circles".to_string(),
            });
        }
        Ok(MultiPolygon::new(polygons))
    }

    /// Marker positions and circle centres, in drawing order.
    ///
    /// Fails with [`CatalogError::Geometry`] on polygons or paths and on a
    /// drawing with no points.
    pub fn points(&self) -> Result<Vec<GeoPoint>> {
        let points = self
            .items
            .iter()
            .map(|item| match item {
                DrawItem::Marker { lat_lng, .. } | DrawItem::Circle { lat_lng, .. } => {
                    Ok(GeoPoint::from(*lat_lng))
                }
                other => Err(CatalogError::Geometry {
                    message: format!("drawtools {} is not a point", other.kind()),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        if points.is_empty() {
            return Err(CatalogError::Geometry {
                message: "drawing has no markers or circles".to_string(),
            });
        }
        Ok(points)
    }
}
