//! Geographic positions and great-circle distance.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Bit-for-bit equality on both components.
    ///
    /// Used for debouncing: attribute churn that re-reports the exact same
    /// coordinates must not produce another delivery.
    pub fn same_as(&self, other: &Position) -> bool {
        self.lat.to_bits() == other.lat.to_bits() && self.lon.to_bits() == other.lon.to_bits()
    }

    /// Surface distance to `other` in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        haversine_distance_m(self, other)
    }
}

/// Great-circle distance between two positions in meters (haversine formula).
///
/// Inputs are not range-checked; NaN in, NaN out.
pub fn haversine_distance_m(a: &Position, b: &Position) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}
