//! Upstream feeds: the primary poll source and enrichment sources
//!
//!  The wire formats of real upstream services live outside this crate.
//!  The replay implementations here read recorded frames from disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::aircraft::{AircraftSnapshot, PollResponse, distance_km};
use crate::error::SourceError;
use crate::sample::{Altitude, RawSample};

/// Upper bound accepted by radius queries
pub const MAX_RADIUS_NM: f64 = 250.0;

const KM_PER_NM: f64 = 1.852;

/// What the poll feed should return
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Radius { lat: f64, lon: f64, radius_nm: f64 },
    Military,
    Ladd,
    Pia,
    Hex(String),
    Callsign(String),
    Registration(String),
    AircraftType(String),
    Squawk(String),
}

impl Query {
    pub fn radius(lat: f64, lon: f64, radius_nm: f64) -> Self {
        Query::Radius {
            lat,
            lon,
            radius_nm: radius_nm.clamp(0.0, MAX_RADIUS_NM),
        }
    }

    /// Whether a snapshot satisfies this query
    pub fn matches(&self, ac: &AircraftSnapshot) -> bool {
        fn eq(field: Option<&str>, want: &str) -> bool {
            field.is_some_and(|f| f.trim().eq_ignore_ascii_case(want))
        }

        match self {
            Query::Radius { lat, lon, radius_nm } => ac
                .position()
                .is_some_and(|(a_lat, a_lon)| {
                    distance_km(*lat, *lon, a_lat, a_lon) <= radius_nm * KM_PER_NM
                }),
            Query::Military => ac.is_military(),
            Query::Ladd => ac.is_ladd(),
            Query::Pia => ac.is_pia(),
            Query::Hex(hex) => ac.hex.eq_ignore_ascii_case(hex),
            Query::Callsign(cs) => eq(ac.callsign(), cs),
            Query::Registration(reg) => eq(ac.registration.as_deref(), reg),
            Query::AircraftType(t) => eq(ac.aircraft_type.as_deref(), t),
            Query::Squawk(sq) => eq(ac.squawk.as_deref(), sq),
        }
    }
}

/// Parses every form except `radius`, which needs a center; see
/// [`Query::radius`].
impl FromStr for Query {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg.trim())),
            None => (s, None),
        };
        let value = |name: &str| -> Result<String, String> {
            arg.filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("query '{}' needs a value ({}:<value>)", name, name))
        };
        match kind {
            "mil" => Ok(Query::Military),
            "ladd" => Ok(Query::Ladd),
            "pia" => Ok(Query::Pia),
            "hex" => Ok(Query::Hex(value("hex")?)),
            "callsign" => Ok(Query::Callsign(value("callsign")?)),
            "reg" => Ok(Query::Registration(value("reg")?)),
            "type" => Ok(Query::AircraftType(value("type")?)),
            "squawk" => Ok(Query::Squawk(value("squawk")?)),
            other => Err(format!("unknown query type: {}", other)),
        }
    }
}

/// The primary fixed-cadence feed
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch(&self, query: &Query) -> Result<PollResponse, SourceError>;
}

/// A position reported by an enrichment feed
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentPosition {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub altitude_ft: Option<f64>,
    /// RFC 3339 observation time
    #[serde(default)]
    pub date: Option<String>,
}

impl EnrichmentPosition {
    /// Unparseable dates leave the timestamp empty so the merge rejects
    /// the sample.
    pub fn to_raw(&self) -> RawSample {
        let timestamp = self
            .date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc).timestamp_millis());
        RawSample {
            latitude: self.lat,
            longitude: self.lon,
            altitude: self.altitude_ft.map(Altitude::Feet),
            timestamp,
        }
    }
}

/// A secondary feed queried per aircraft
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    /// Positions known for `entity_hint`, or `None` when the feed has nothing
    async fn fetch(&self, entity_hint: &str)
    -> Result<Option<Vec<EnrichmentPosition>>, SourceError>;
}

/// Replays newline-delimited JSON poll frames
pub struct ReplayPollSource {
    frames: Vec<String>,
    cursor: Mutex<usize>,
    looping: bool,
    /// Replace each frame's `now` with the wall clock
    rebase: bool,
}

impl ReplayPollSource {
    pub fn open(path: impl AsRef<Path>, looping: bool, rebase: bool) -> Result<Self, SourceError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_frames(&content, looping, rebase))
    }

    pub fn from_frames(content: &str, looping: bool, rebase: bool) -> Self {
        let frames = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            frames,
            cursor: Mutex::new(0),
            looping,
            rebase,
        }
    }

    fn next_frame(&self) -> Option<String> {
        let mut cursor = self.cursor.lock();
        if *cursor >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return None;
            }
            *cursor = 0;
        }
        let frame = self.frames[*cursor].clone();
        *cursor += 1;
        Some(frame)
    }
}

#[async_trait]
impl PollSource for ReplayPollSource {
    async fn fetch(&self, query: &Query) -> Result<PollResponse, SourceError> {
        let frame = self.next_frame().ok_or(SourceError::Exhausted)?;
        let mut response: PollResponse = serde_json::from_str(&frame)?;
        if self.rebase {
            response.now = Utc::now().timestamp_millis();
        }
        response.ac.retain(|ac| query.matches(ac));
        Ok(response)
    }
}

/// Serves recorded enrichment positions keyed by aircraft id
pub struct ReplayEnrichmentSource {
    positions: HashMap<String, Vec<EnrichmentPosition>>,
}

impl ReplayEnrichmentSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let content = fs::read_to_string(path)?;
        Ok(Self {
            positions: serde_json::from_str(&content)?,
        })
    }
}

#[async_trait]
impl EnrichmentSource for ReplayEnrichmentSource {
    async fn fetch(
        &self,
        entity_hint: &str,
    ) -> Result<Option<Vec<EnrichmentPosition>>, SourceError> {
        Ok(self.positions.get(entity_hint).cloned())
    }
}
