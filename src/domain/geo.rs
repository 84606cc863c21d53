// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_zero(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }

    /// Devices report `(0,0)` and `(1000,1000)` while they have no fix.
    pub fn is_valid(&self) -> bool {
        if self.is_zero() || (self.lat == 1000.0 && self.lng == 1000.0) {
            return false;
        }
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn distance_to(&self, other: &Location) -> f64 {
        distance_m(self, other)
    }
}

/// Haversine distance in meters.
pub fn distance_m(a: &Location, b: &Location) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Point reached after travelling `distance` meters on `bearing_deg`.
pub fn destination(origin: &Location, bearing_deg: f64, distance: f64) -> Location {
    let delta = distance / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let lat1 = origin.lat.to_radians();
    let lng1 = origin.lng.to_radians();
    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lng2 = lng1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());
    Location::new(lat2.to_degrees(), normalize_lng(lng2.to_degrees()))
}

/// Linear interpolation along the segment; precise enough for walk waypoints.
pub fn intermediate(from: &Location, to: &Location, fraction: f64) -> Location {
    let f = fraction.clamp(0.0, 1.0);
    Location::new(
        from.lat + (to.lat - from.lat) * f,
        from.lng + (to.lng - from.lng) * f,
    )
}

fn normalize_lng(lng: f64) -> f64 {
    let mut v = (lng + 540.0) % 360.0 - 180.0;
    if v == -180.0 {
        v = 180.0;
    }
    v
}

/// Polygon geofence. An empty fence contains every point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    #[serde(default)]
    pub points: Vec<Location>,
}

impl Geofence {
    pub fn contains(&self, loc: &Location) -> bool {
        if self.points.len() < 3 {
            return true;
        }
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (pi, pj) = (&self.points[i], &self.points[j]);
            if (pi.lng > loc.lng) != (pj.lng > loc.lng)
                && loc.lat < (pj.lat - pi.lat) * (loc.lng - pi.lng) / (pj.lng - pi.lng) + pi.lat
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    pub fn centroid(&self) -> Option<Location> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f64;
        let (lat, lng) = self
            .points
            .iter()
            .fold((0.0, 0.0), |acc, p| (acc.0 + p.lat, acc.1 + p.lng));
        Some(Location::new(lat / n, lng / n))
    }

    /// `(min_lat, min_lng, max_lat, max_lng)`
    pub fn bounding_box(&self) -> Option<(f64, f64, f64, f64)> {
        let first = self.points.first()?;
        Some(self.points.iter().fold(
            (first.lat, first.lng, first.lat, first.lng),
            |(a, b, c, d), p| (a.min(p.lat), b.min(p.lng), c.max(p.lat), d.max(p.lng)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_matches_known_values() {
        let berlin = Location::new(52.5200, 13.4050);
        let potsdam = Location::new(52.3906, 13.0645);
        let d = distance_m(&berlin, &potsdam);
        assert!((d - 27_100.0).abs() < 500.0, "got {d}");
        assert_eq!(distance_m(&berlin, &berlin), 0.0);
    }

    #[test]
    fn destination_round_trips_distance() {
        let start = Location::new(40.0, -105.0);
        let end = destination(&start, 90.0, 35.0);
        assert!((distance_m(&start, &end) - 35.0).abs() < 0.01);
    }

    #[test]
    fn invalid_locations_are_rejected() {
        assert!(!Location::new(0.0, 0.0).is_valid());
        assert!(!Location::new(1000.0, 1000.0).is_valid());
        assert!(!Location::new(95.0, 10.0).is_valid());
        assert!(Location::new(52.52, 13.405).is_valid());
    }

    #[test]
    fn geofence_contains_and_centroid() {
        let fence = Geofence {
            points: vec![
                Location::new(0.0, 0.0),
                Location::new(0.0, 2.0),
                Location::new(2.0, 2.0),
                Location::new(2.0, 0.0),
            ],
        };
        assert!(fence.contains(&Location::new(1.0, 1.0)));
        assert!(!fence.contains(&Location::new(3.0, 1.0)));
        assert_eq!(fence.centroid(), Some(Location::new(1.0, 1.0)));
        assert!(Geofence::default().contains(&Location::new(10.0, 10.0)));
    }
}
