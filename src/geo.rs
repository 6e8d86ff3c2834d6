//! Geographic predicates for drop fencing.
//!
//! Fences consume a client-supplied coordinate. There is no IP
//! geolocation here; a spoofed coordinate is a product decision, not a
//! security boundary.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS-84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Fence shape attached to a drop config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum GeoFence {
    /// All points within `radius_m` of `center`.
    Circle { center: GeoPoint, radius_m: f64 },
    /// Closed polygon; vertices in order, no self-intersection expected.
    Polygon { points: Vec<GeoPoint> },
}

/// How the fence affects registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoFenceMode {
    /// Outside the fence → registration rejected.
    Exclusive,
    /// Inside the fence → effective tickets multiplied.
    Bonus,
}

/// Great-circle distance in meters between two coordinates.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Ray-cast point-in-polygon on the lat/lon plane.
///
/// Adequate for city-scale fences; not for fences crossing the
/// antimeridian or poles.
pub fn point_in_polygon(p: GeoPoint, polygon: &[GeoPoint]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (vi, vj) = (polygon[i], polygon[j]);
        let crosses = (vi.lat > p.lat) != (vj.lat > p.lat);
        if crosses {
            let x = (vj.lon - vi.lon) * (p.lat - vi.lat) / (vj.lat - vi.lat) + vi.lon;
            if p.lon < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

impl GeoFence {
    /// Whether the point is inside the fence.
    pub fn contains(&self, p: GeoPoint) -> bool {
        match self {
            GeoFence::Circle { center, radius_m } => haversine_m(*center, p) <= *radius_m,
            GeoFence::Polygon { points } => point_in_polygon(p, points),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint { lat, lon }
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London ≈ 344 km
        let paris = p(48.8566, 2.3522);
        let london = p(51.5074, -0.1278);
        let d = haversine_m(paris, london);
        assert!((d - 344_000.0).abs() < 5_000.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero() {
        let a = p(40.0, -73.0);
        assert_eq!(haversine_m(a, a), 0.0);
    }

    #[test]
    fn test_point_in_square() {
        let square = vec![p(0.0, 0.0), p(0.0, 10.0), p(10.0, 10.0), p(10.0, 0.0)];
        assert!(point_in_polygon(p(5.0, 5.0), &square));
        assert!(!point_in_polygon(p(15.0, 5.0), &square));
        assert!(!point_in_polygon(p(-1.0, -1.0), &square));
    }

    #[test]
    fn test_degenerate_polygon_never_contains() {
        assert!(!point_in_polygon(p(0.0, 0.0), &[]));
        assert!(!point_in_polygon(p(0.0, 0.0), &[p(1.0, 1.0), p(2.0, 2.0)]));
    }

    #[test]
    fn test_circle_fence() {
        let fence = GeoFence::Circle {
            center: p(40.7128, -74.0060),
            radius_m: 1_000.0,
        };
        assert!(fence.contains(p(40.7128, -74.0060)));
        assert!(!fence.contains(p(40.8, -74.0060)));
    }

    #[test]
    fn test_polygon_fence() {
        let fence = GeoFence::Polygon {
            points: vec![p(0.0, 0.0), p(0.0, 1.0), p(1.0, 1.0), p(1.0, 0.0)],
        };
        assert!(fence.contains(p(0.5, 0.5)));
        assert!(!fence.contains(p(2.0, 2.0)));
    }
}
