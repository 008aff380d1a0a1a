//! Common types for the TrackViz environment abstraction.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a tracked entity (the driver number upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Returns the raw numeric id.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for EntityId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A position in the course's local coordinate frame.
///
/// X/Y span the ground plane; Z is altitude and only matters for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Returns the point shifted along Z.
    pub fn lowered(self, dz: f64) -> Self {
        Self {
            z: self.z - dz,
            ..self
        }
    }
}

/// One position observation as served upstream.
///
/// The timestamp is kept verbatim; [`Sample::timestamp`] parses it on demand
/// so an odd timestamp never prevents the sample itself from flowing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Raw upstream timestamp (RFC 3339, offset optional)
    pub date: String,

    /// Entity the sample belongs to
    pub driver_number: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_key: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<u32>,

    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Sample {
    /// Creates a sample with no meeting/session annotation.
    pub fn new(entity: EntityId, date: impl Into<String>, x: i64, y: i64, z: i64) -> Self {
        Self {
            date: date.into(),
            driver_number: entity.0,
            meeting_key: None,
            session_key: None,
            x,
            y,
            z,
        }
    }

    pub fn entity(&self) -> EntityId {
        EntityId(self.driver_number)
    }

    pub fn position(&self) -> Point3 {
        Point3::new(self.x as f64, self.y as f64, self.z as f64)
    }

    /// Parses the sample timestamp, `None` when it is malformed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.date)
    }
}

/// Parses an upstream timestamp.
///
/// Accepts RFC 3339 with an offset and the naive `YYYY-MM-DDTHH:MM:SS[.fff]`
/// form, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Session selection criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    pub circuit_key: u32,
    pub session_name: String,
    pub year: i32,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            circuit_key: 9,
            session_name: "Race".to_string(),
            year: 2023,
        }
    }
}

/// A session as listed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_key: u32,
    pub date_start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_end: Option<String>,
}

impl SessionInfo {
    /// Parses `date_start`.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.date_start)
    }
}

/// RGBA color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

/// A point handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColoredPoint {
    pub position: Point3,
    pub color: Color,
}

impl ColoredPoint {
    pub fn new(position: Point3, color: Color) -> Self {
        Self { position, color }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2023-09-17T12:03:11.617000+00:00").unwrap();
        assert_eq!(ts.year(), 2023);
        assert_eq!(ts.hour(), 12);
        assert_eq!(ts.timestamp_subsec_millis(), 617);
    }

    #[test]
    fn test_parse_naive_is_utc() {
        let naive = parse_timestamp("2023-09-17T12:03:11.617").unwrap();
        let explicit = parse_timestamp("2023-09-17T12:03:11.617Z").unwrap();
        assert_eq!(naive, explicit);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_sample_decodes_upstream_json() {
        let raw = r#"{
            "date": "2023-09-17T12:03:11.617000+00:00",
            "driver_number": 44,
            "meeting_key": 1219,
            "session_key": 9161,
            "x": -641,
            "y": -922,
            "z": 1303
        }"#;
        let sample: Sample = serde_json::from_str(raw).unwrap();
        assert_eq!(sample.entity(), EntityId(44));
        assert_eq!(sample.position(), Point3::new(-641.0, -922.0, 1303.0));
        assert_eq!(sample.session_key, Some(9161));
        assert!(sample.timestamp().is_some());
    }

    #[test]
    fn test_session_start_time() {
        let session = SessionInfo {
            session_key: 9161,
            date_start: "2023-09-17T12:00:00+00:00".to_string(),
            date_end: None,
        };
        assert_eq!(session.start_time().unwrap().minute(), 0);

        let broken = SessionInfo {
            date_start: "yesterday".to_string(),
            ..session
        };
        assert!(broken.start_time().is_none());
    }

    #[test]
    fn test_entity_id_is_transparent_in_json() {
        let json = serde_json::to_string(&EntityId(44)).unwrap();
        assert_eq!(json, "44");
    }
}
