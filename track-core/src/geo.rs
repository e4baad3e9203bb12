//! Geodesy helpers and bounding boxes.

use serde::{Deserialize, Serialize};

use crate::types::{valid_lat, valid_lon, Result, TrackError};

// ---------------------------------------------------------------------------
// Haversine
// ---------------------------------------------------------------------------

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Smallest angle between two courses, in [0, 180].
pub fn course_delta(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

// ---------------------------------------------------------------------------
// Bounding box
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Result<Self> {
        for lat in [min_lat, max_lat] {
            if !valid_lat(lat) {
                return Err(TrackError::InvalidArea(format!("latitude {lat} out of range")));
            }
        }
        for lon in [min_lon, max_lon] {
            if !valid_lon(lon) {
                return Err(TrackError::InvalidArea(format!("longitude {lon} out of range")));
            }
        }
        if min_lat > max_lat {
            return Err(TrackError::InvalidArea(format!(
                "min_lat {min_lat} > max_lat {max_lat}"
            )));
        }
        if min_lon > max_lon {
            return Err(TrackError::InvalidArea(format!(
                "min_lon {min_lon} > max_lon {max_lon}"
            )));
        }
        Ok(BoundingBox {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    /// Inclusive on both axes.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Normalized subscription key, six decimals per edge.
    pub fn area_key(&self) -> String {
        format!(
            "area_{:.6}_{:.6}_{:.6}_{:.6}",
            self.min_lat, self.max_lat, self.min_lon, self.max_lon
        )
    }

    /// Inverse of [`BoundingBox::area_key`].
    pub fn from_area_key(key: &str) -> Result<Self> {
        let rest = key
            .strip_prefix("area_")
            .ok_or_else(|| TrackError::InvalidArea(format!("not an area key: {key}")))?;
        let parts: Vec<f64> = rest
            .split('_')
            .map(|p| p.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TrackError::InvalidArea(format!("{key}: {e}")))?;
        match parts.as_slice() {
            [a, b, c, d] => BoundingBox::new(*a, *b, *c, *d),
            _ => Err(TrackError::InvalidArea(format!("{key}: expected 4 edges"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
