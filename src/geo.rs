//! Coordinate primitives shared by the geocoder, the product store and search.
//!
//! Points are always longitude-first, matching the `[lng, lat]` layout used in
//! stored locations and in provider responses.

use serde::{Deserialize, Serialize};

/// Mean earth radius in kilometres (IUGG).
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Slack added to bounding boxes so float rounding never excludes a point the
/// exact distance test would accept.
const BOX_PADDING_DEG: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lng: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Builds a point from a `[lng, lat]` pair.
    pub fn from_coordinates(coordinates: [f64; 2]) -> Self {
        Self::new(coordinates[0], coordinates[1])
    }

    pub fn coordinates(&self) -> [f64; 2] {
        [self.lng, self.lat]
    }

    /// Checks that both components are finite and inside the valid ranges.
    /// The error string describes the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if !self.lng.is_finite() || !self.lat.is_finite() {
            return Err(format!(
                "coordinates must be finite numbers, got [{}, {}]",
                self.lng, self.lat
            ));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(format!("longitude {} outside [-180, 180]", self.lng));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(format!("latitude {} outside [-90, 90]", self.lat));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Great-circle distance between two points in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Axis-aligned lat/lng rectangle enclosing every point within a radius of a
/// centre. Only used to narrow index scans; membership is always decided by
/// [`haversine_km`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        let angular = radius_km / EARTH_RADIUS_KM;
        let d_lat = angular.to_degrees() + BOX_PADDING_DEG;
        let min_lat = center.lat - d_lat;
        let max_lat = center.lat + d_lat;

        // Boxes touching a pole or spanning the antimeridian fall back to the
        // full longitude range.
        if min_lat <= -90.0 || max_lat >= 90.0 || angular >= std::f64::consts::PI {
            return Self {
                min_lat: min_lat.max(-90.0),
                max_lat: max_lat.min(90.0),
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }

        let ratio = angular.sin() / center.lat.to_radians().cos();
        if ratio >= 1.0 {
            return Self {
                min_lat,
                max_lat,
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }
        let d_lng = ratio.asin().to_degrees() + BOX_PADDING_DEG;
        let min_lng = center.lng - d_lng;
        let max_lng = center.lng + d_lng;
        if min_lng < -180.0 || max_lng > 180.0 {
            return Self {
                min_lat,
                max_lat,
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }

        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_and_non_finite() {
        assert!(GeoPoint::new(180.0, 90.0).is_valid());
        assert!(GeoPoint::new(-180.0, -90.0).is_valid());
        assert!(!GeoPoint::new(180.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -90.01).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn measures_known_distances() {
        let london = GeoPoint::new(-0.1278, 51.5074);
        let paris = GeoPoint::new(2.3522, 48.8566);
        let km = haversine_km(london, paris);
        assert!((km - 343.5).abs() < 2.0, "got {km}");
        assert_eq!(haversine_km(london, london), 0.0);

        let quarter = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(90.0, 0.0));
        assert!((quarter - EARTH_RADIUS_KM * std::f64::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_contains_points_on_the_radius() {
        let center = GeoPoint::new(77.2, 28.6);
        let radius = 25.0;
        let bbox = BoundingBox::around(center, radius);
        for bearing in 0..36 {
            let theta = (bearing as f64 * 10.0).to_radians();
            let point = destination(center, radius * 0.999, theta);
            assert!(haversine_km(center, point) <= radius);
            assert!(bbox.contains(point), "bearing {bearing} escaped {bbox:?}");
        }
    }

    #[test]
    fn bounding_box_widens_near_poles_and_antimeridian() {
        let polar = BoundingBox::around(GeoPoint::new(10.0, 89.99), 5.0);
        assert_eq!(polar.min_lng, -180.0);
        assert_eq!(polar.max_lng, 180.0);

        let dateline = BoundingBox::around(GeoPoint::new(179.99, 0.0), 50.0);
        assert_eq!(dateline.min_lng, -180.0);
        assert!(dateline.contains(GeoPoint::new(-179.9, 0.0)));
    }

    fn destination(origin: GeoPoint, distance_km: f64, bearing: f64) -> GeoPoint {
        let angular = distance_km / EARTH_RADIUS_KM;
        let lat1 = origin.lat.to_radians();
        let lng1 = origin.lng.to_radians();
        let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
        let lng2 = lng1
            + (bearing.sin() * angular.sin() * lat1.cos())
                .atan2(angular.cos() - lat1.sin() * lat2.sin());
        GeoPoint::new(lng2.to_degrees(), lat2.to_degrees())
    }
}
