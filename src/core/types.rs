//! Core data types for the tracking link

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::constants::DOP_UNKNOWN;

/// Geographic position in signed decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// GPS fix state assembled from NMEA sentences
///
/// Only the NMEA parser writes the sentence-derived fields; `valid` and
/// `last_update` are written by the periodic fix evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsFix {
    /// Latitude in decimal degrees (negative south)
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees (negative west)
    pub longitude: Option<f64>,
    /// Altitude above mean sea level (meters)
    pub altitude: Option<f64>,
    /// Ground speed (km/h)
    pub speed_kmh: Option<f64>,
    /// Course over ground (degrees, 0-360)
    pub course_deg: Option<f64>,
    /// Satellites used (GGA) or in view (GSV fallback)
    pub satellites: u32,
    /// 0 = none, 1 = GPS, 2 = DGPS, 3 = PPS
    pub fix_quality: u8,
    /// 1 = none, 2 = 2D, 3 = 3D
    pub fix_type: u8,
    pub hdop: f64,
    pub pdop: f64,
    /// UTC time as reported (HHMMSS.SSS)
    pub utc_time: Option<String>,
    /// UTC date as reported (DDMMYY)
    pub utc_date: Option<String>,
    /// Verdict of the last fix evaluation
    pub valid: bool,
    /// Epoch seconds of the last fix evaluation
    pub last_update: f64,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            altitude: None,
            speed_kmh: None,
            course_deg: None,
            satellites: 0,
            fix_quality: 0,
            fix_type: 1,
            hdop: DOP_UNKNOWN,
            pdop: DOP_UNKNOWN,
            utc_time: None,
            utc_date: None,
            valid: false,
            last_update: 0.0,
        }
    }
}

impl GpsFix {
    /// Position if both coordinates have been reported
    pub fn position(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }

    /// Combined UTC date and time from RMC/GGA fields
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        let date = self.utc_date.as_deref()?;
        let time = self.utc_time.as_deref()?;
        let naive =
            NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%d%m%y %H%M%S%.f").ok()?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

/// Current wall-clock time as fractional epoch seconds
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
