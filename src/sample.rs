//! Position samples and per-aircraft tracks

use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Barometric altitude as reported by a feed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Altitude {
    /// Altitude in feet
    Feet(f64),
    /// Aircraft reported on the ground
    OnGround,
}

impl Serialize for Altitude {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Altitude::Feet(ft) => serializer.serialize_f64(*ft),
            Altitude::OnGround => serializer.serialize_str("ground"),
        }
    }
}

impl<'de> Deserialize<'de> for Altitude {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Feet(f64),
            Label(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Feet(ft) => Ok(Altitude::Feet(ft)),
            Repr::Label(label) if label == "ground" => Ok(Altitude::OnGround),
            Repr::Label(other) => Err(de::Error::invalid_value(
                Unexpected::Str(&other),
                &"a number or \"ground\"",
            )),
        }
    }
}

/// One observed position. `timestamp` is milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "alt_baro", default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<Altitude>,
    #[serde(rename = "time")]
    pub timestamp: i64,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<Altitude>, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            timestamp,
        }
    }
}

/// A sample as it arrives from a feed, before validation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawSample {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<Altitude>,
    pub timestamp: Option<i64>,
}

impl RawSample {
    /// Validate into a `PositionSample`; `None` when a coordinate or the
    /// timestamp is missing or a coordinate is not finite.
    pub fn into_sample(self) -> Option<PositionSample> {
        let latitude = self.latitude.filter(|v| v.is_finite())?;
        let longitude = self.longitude.filter(|v| v.is_finite())?;
        let timestamp = self.timestamp?;
        Some(PositionSample::new(latitude, longitude, self.altitude, timestamp))
    }
}

impl From<PositionSample> for RawSample {
    fn from(sample: PositionSample) -> Self {
        Self {
            latitude: Some(sample.latitude),
            longitude: Some(sample.longitude),
            altitude: sample.altitude,
            timestamp: Some(sample.timestamp),
        }
    }
}

/// Which feed contributed a batch of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The fixed-cadence poll feed; never de-duplicated
    Primary,
    /// Enrichment feeds; subject to the de-duplication window
    Secondary,
}

/// Ordered position history of one aircraft.
///
/// Samples are kept in non-decreasing timestamp order. The only way to
/// grow a track is through [`crate::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Track {
    samples: Vec<PositionSample>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a track from samples in any order
    pub fn from_samples(mut samples: Vec<PositionSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    pub fn samples(&self) -> &[PositionSample] {
        &self.samples
    }

    /// Timestamp of the most recent sample
    pub fn last_timestamp(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub(crate) fn into_samples(self) -> Vec<PositionSample> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_altitude_json() {
        let ground: Altitude = serde_json::from_str("\"ground\"").unwrap();
        assert_eq!(ground, Altitude::OnGround);
        let feet: Altitude = serde_json::from_str("35000").unwrap();
        assert_eq!(feet, Altitude::Feet(35000.0));
        assert!(serde_json::from_str::<Altitude>("\"air\"").is_err());
        assert_eq!(serde_json::to_string(&Altitude::OnGround).unwrap(), "\"ground\"");
    }

    #[test]
    fn test_sample_persisted_layout() {
        let sample = PositionSample::new(40.79, -111.97, Some(Altitude::Feet(4200.0)), 95_000);
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json["lat"], 40.79);
        assert_eq!(json["lon"], -111.97);
        assert_eq!(json["alt_baro"], 4200.0);
        assert_eq!(json["time"], 95_000);

        let bare = PositionSample::new(1.0, 2.0, None, 3);
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("alt_baro"));
    }

    #[test]
    fn test_raw_sample_validation() {
        let valid = RawSample {
            latitude: Some(1.0),
            longitude: Some(2.0),
            altitude: None,
            timestamp: Some(10),
        };
        assert!(valid.into_sample().is_some());

        let no_lat = RawSample { latitude: None, ..valid };
        assert!(no_lat.into_sample().is_none());

        let no_time = RawSample { timestamp: None, ..valid };
        assert!(no_time.into_sample().is_none());

        let nan_lon = RawSample { longitude: Some(f64::NAN), ..valid };
        assert!(nan_lon.into_sample().is_none());
    }

    #[test]
    fn test_track_from_samples_sorts() {
        let track = Track::from_samples(vec![
            PositionSample::new(0.0, 0.0, None, 30),
            PositionSample::new(0.0, 0.0, None, 10),
            PositionSample::new(0.0, 0.0, None, 20),
        ]);
        let times: Vec<i64> = track.samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(track.last_timestamp(), Some(30));
        assert!(Track::new().last_timestamp().is_none());
    }
}
