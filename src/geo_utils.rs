//! Geographic utilities: distances, centers and a local planar projection.

use geo::{Distance, Haversine, Point};

use crate::GeoPoint;

/// Mean Earth radius in meters, the same radius `geo` uses for haversine.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2))
}

/// `geo` point (x = longitude, y = latitude).
pub fn to_point(p: &GeoPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

/// Arithmetic mean of the points. Returns (0, 0) for an empty slice.
pub fn compute_center(points: &[GeoPoint]) -> GeoPoint {
    if points.is_empty() {
        return GeoPoint::new(0.0, 0.0);
    }
    let n = points.len() as f64;
    let (lat_sum, lng_sum) = points.iter().fold((0.0, 0.0), |(lat, lng), p| {
        (lat + p.latitude, lng + p.longitude)
    });
    GeoPoint::new(lat_sum / n, lng_sum / n)
}

/// Largest haversine distance between any two of the points.
pub fn max_pairwise_distance(points: &[GeoPoint]) -> f64 {
    let mut max = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            max = max.max(haversine_distance(a, b));
        }
    }
    max
}

/// Equirectangular projection around a reference point.
///
/// Accurate to well under a percent over the few kilometres a cluster spans,
/// which is all the nearest-neighbour ordering needs.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.latitude.to_radians().cos(),
        }
    }

    /// Projection centered on the mean of the points.
    pub fn centered_on(points: &[GeoPoint]) -> Self {
        Self::new(compute_center(points))
    }

    /// Planar `[x, y]` coordinates in meters relative to the origin.
    pub fn project(&self, point: &GeoPoint) -> [f64; 2] {
        let x = (point.longitude - self.origin.longitude).to_radians() * self.cos_lat * EARTH_RADIUS_M;
        let y = (point.latitude - self.origin.latitude).to_radians() * EARTH_RADIUS_M;
        [x, y]
    }
}
