//! Aircraft snapshots as reported by the poll feed

use serde::{Deserialize, Serialize};

use crate::sample::{Altitude, RawSample};

/// Database flag bits carried in `dbFlags`
pub const FLAG_MILITARY: u32 = 1;
pub const FLAG_PIA: u32 = 4;
pub const FLAG_LADD: u32 = 8;

/// Latest state of one aircraft from a poll response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftSnapshot {
    /// ICAO address as 6 hex digits; `~` prefix for non-ICAO addresses
    pub hex: String,
    /// Callsign, padded to 8 characters by most feeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    /// Registration
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    /// Aircraft type designator
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub aircraft_type: Option<String>,
    #[serde(rename = "dbFlags", default)]
    pub db_flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<Altitude>,
    /// Ground speed in knots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    /// Track over ground in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    /// Seconds since any message was received
    #[serde(default)]
    pub seen: f64,
    /// Seconds since the position was last updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_pos: Option<f64>,
}

impl AircraftSnapshot {
    #[allow(dead_code)]
    pub fn new(hex: &str) -> Self {
        Self {
            hex: hex.to_string(),
            ..Self::default()
        }
    }

    /// Current position, if the feed reported a usable one
    pub fn position(&self) -> Option<(f64, f64)> {
        let lat = self.lat.filter(|v| v.is_finite())?;
        let lon = self.lon.filter(|v| v.is_finite())?;
        // feeds report 0,0 for "no position"
        if lat == 0.0 && lon == 0.0 {
            return None;
        }
        Some((lat, lon))
    }

    /// Sample observed `seen` seconds before the server's `now` (ms)
    pub fn sample_at(&self, now: i64) -> Option<RawSample> {
        let (lat, lon) = self.position()?;
        let age_ms = (self.seen.max(0.0) * 1000.0).round() as i64;
        Some(RawSample {
            latitude: Some(lat),
            longitude: Some(lon),
            altitude: self.alt_baro,
            timestamp: Some(now - age_ms),
        })
    }

    pub fn is_military(&self) -> bool {
        self.db_flags & FLAG_MILITARY != 0
    }

    pub fn is_pia(&self) -> bool {
        self.db_flags & FLAG_PIA != 0
    }

    pub fn is_ladd(&self) -> bool {
        self.db_flags & FLAG_LADD != 0
    }

    pub fn callsign(&self) -> Option<&str> {
        self.flight.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// One poll response: every aircraft matching the query plus the server's
/// clock in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub ac: Vec<AircraftSnapshot>,
    pub now: i64,
}

/// Great-circle distance in kilometres (haversine)
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}
