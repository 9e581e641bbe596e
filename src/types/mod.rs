use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Backend identifier of a shared ride.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(pub u64);

impl Display for RideId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RideId {
    fn from(id: u64) -> Self {
        RideId(id)
    }
}

/// WGS84 coordinate in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Raw position sample as delivered by the platform location API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            accuracy,
            speed: None,
            heading: None,
        }
    }
}

/// Accepted position fix, buffered until flushed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy_m: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>, accuracy_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy_m,
            speed_mps: None,
            heading_deg: None,
        }
    }

    /// Synthetic fix stamped with the current wall clock.
    pub fn synthetic(point: GeoPoint, accuracy_m: f64) -> Self {
        Self::new(point.lat, point.lng, Utc::now(), accuracy_m)
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

impl From<RawFix> for LocationFix {
    fn from(raw: RawFix) -> Self {
        // Out-of-range platform timestamps fall back to "now"
        let timestamp = DateTime::<Utc>::from_timestamp_millis(raw.timestamp_ms).unwrap_or_else(Utc::now);
        LocationFix {
            latitude: raw.latitude,
            longitude: raw.longitude,
            timestamp,
            accuracy_m: raw.accuracy,
            speed_mps: raw.speed,
            heading_deg: raw.heading,
        }
    }
}

/// Wire format of one point in a `POST /rides/{id}/track` batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: String,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

impl From<&LocationFix> for TrackPoint {
    fn from(fix: &LocationFix) -> Self {
        TrackPoint {
            lat: fix.latitude,
            lng: fix.longitude,
            timestamp: fix.timestamp.to_rfc3339(),
            accuracy: fix.accuracy_m,
            speed: fix.speed_mps,
            heading: fix.heading_deg,
        }
    }
}

/// Host application visibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    Foreground,
    Background,
}

impl AppState {
    pub fn is_foreground(self) -> bool {
        self == AppState::Foreground
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_fix_conversion_keeps_extras() {
        let mut raw = RawFix::new(10.77, 106.70, 1_700_000_000_000, 8.0);
        raw.speed = Some(4.2);

        let fix = LocationFix::from(raw);
        assert_eq!(fix.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(fix.speed_mps, Some(4.2));
        assert_eq!(fix.heading_deg, None);
    }

    #[test]
    fn test_track_point_wire_shape() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let fix = LocationFix::new(10.5, 106.25, ts, 12.0);

        let json = serde_json::to_value(TrackPoint::from(&fix)).unwrap();
        assert_eq!(json["lat"], 10.5);
        assert_eq!(json["lng"], 106.25);
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20+00:00");
        assert!(json.get("speed").is_none());
    }

    #[test]
    fn test_ride_id_is_transparent() {
        assert_eq!(serde_json::to_string(&RideId(42)).unwrap(), "42");
        assert_eq!(RideId(7).to_string(), "7");
    }
}
