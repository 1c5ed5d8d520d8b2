//! Spherical geodesy helpers.
//!
//! Pure functions over [`GeoPoint`] with no knowledge of zones or events. The
//! ETA projector builds its wedges from [`initial_bearing_deg`] and
//! [`destination`]; anything else that needs great-circle math should use
//! this module instead of re-deriving the formulas.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters used by every formula in this module.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A `(longitude, latitude)` pair in decimal degrees.
///
/// Serializes as a two-element array `[lng, lat]`, the GeoJSON position order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct GeoPoint {
    /// Longitude in degrees (-180 to 180)
    pub lon: f64,
    /// Latitude in degrees (-90 to 90)
    pub lat: f64,
}

impl GeoPoint {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Both coordinates are finite.
    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }

    /// Finite and inside the longitude/latitude ranges.
    pub fn is_valid(&self) -> bool {
        self.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }
}

impl From<[f64; 2]> for GeoPoint {
    fn from([lon, lat]: [f64; 2]) -> Self {
        Self { lon, lat }
    }
}

impl From<GeoPoint> for [f64; 2] {
    fn from(p: GeoPoint) -> Self {
        [p.lon, p.lat]
    }
}

/// Initial great-circle bearing from `from` to `to`, normalized to `[0, 360)`.
pub fn initial_bearing_deg(from: GeoPoint, to: GeoPoint) -> f64 {
    let phi1 = from.lat.to_radians();
    let phi2 = to.lat.to_radians();
    let delta_lambda = (to.lon - from.lon).to_radians();

    let y = delta_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * delta_lambda.cos();

    normalize_bearing(y.atan2(x).to_degrees())
}

/// Point reached by travelling `distance_m` meters from `from` along the
/// great circle with initial bearing `bearing_deg`.
///
/// The resulting longitude is wrapped into `[-180, 180)`.
pub fn destination(from: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let phi1 = from.lat.to_radians();
    let lambda1 = from.lon.to_radians();
    let theta = bearing_deg.to_radians();
    let delta = distance_m / EARTH_RADIUS_M;

    let sin_phi2 = phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos();
    let phi2 = sin_phi2.clamp(-1.0, 1.0).asin();

    let y = theta.sin() * delta.sin() * phi1.cos();
    let x = delta.cos() - phi1.sin() * phi2.sin();
    let lambda2 = lambda1 + y.atan2(x);

    GeoPoint::new(
        (lambda2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0,
        phi2.to_degrees(),
    )
}

/// Great-circle distance in meters (haversine).
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Fold any angle in degrees into `[0, 360)`.
pub fn normalize_bearing(deg: f64) -> f64 {
    let b = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if b >= 360.0 {
        0.0
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearing_due_north_and_east() {
        let origin = GeoPoint::new(0.0, 0.0);
        assert!(initial_bearing_deg(origin, GeoPoint::new(0.0, 1.0)).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, GeoPoint::new(1.0, 0.0)) - 90.0).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, GeoPoint::new(0.0, -1.0)) - 180.0).abs() < 1e-9);
        assert!((initial_bearing_deg(origin, GeoPoint::new(-1.0, 0.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_destination_one_degree_north() {
        // One degree of arc on the sphere
        let d = EARTH_RADIUS_M * 1f64.to_radians();
        let p = destination(GeoPoint::new(54.0, 24.0), 0.0, d);
        assert!((p.lat - 25.0).abs() < 1e-9);
        assert!((p.lon - 54.0).abs() < 1e-9);
    }

    #[test]
    fn test_destination_wraps_antimeridian() {
        let p = destination(GeoPoint::new(179.9, 0.0), 90.0, 50_000.0);
        assert!(p.lon < -179.0 && p.lon >= -180.0, "lon = {}", p.lon);
    }

    #[test]
    fn test_destination_then_distance_agrees() {
        let start = GeoPoint::new(54.4585, 24.3288);
        let end = destination(start, 37.0, 12_345.0);
        assert!((haversine_m(start, end) - 12_345.0).abs() < 0.01);
        assert!((initial_bearing_deg(start, end) - 37.0).abs() < 0.01);
    }

    #[test]
    fn test_normalize_bearing() {
        assert_eq!(normalize_bearing(-90.0), 270.0);
        assert_eq!(normalize_bearing(720.0), 0.0);
        assert!(normalize_bearing(-1e-20) < 360.0);
    }

    #[test]
    fn test_point_validity() {
        assert!(GeoPoint::new(180.0, -90.0).is_valid());
        assert!(!GeoPoint::new(181.0, 0.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn test_point_serializes_as_lng_lat_array() {
        let json = serde_json::to_string(&GeoPoint::new(54.5, 24.3)).unwrap();
        assert_eq!(json, "[54.5,24.3]");
        let back: GeoPoint = serde_json::from_str("[1.0,2.0]").unwrap();
        assert_eq!(back, GeoPoint::new(1.0, 2.0));
    }
}
