use crate::error::{GpxError, Result};

/// Radius of the sphere used for great-circle distances, in meters.
pub const EARTH_RADIUS_M: f64 = 6_378_700.0;

/// A latitude/longitude pair in decimal degrees, checked on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(GpxError::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }
}

pub fn deg_to_rad(deg: f64) -> f64 {
    deg.to_radians()
}

/// Haversine great-circle distance in meters.
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = deg_to_rad(a.lat);
    let lat2 = deg_to_rad(b.lat);
    let dlat = deg_to_rad(b.lat - a.lat);
    let dlon = deg_to_rad(b.lon - a.lon);

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1 for antipodal points.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
