//! Line sources feeding the GPS receiver

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tracing::info;

use crate::core::GeoPoint;
use crate::gps::nmea::with_checksum;
use crate::hardware::{HardwareError, HardwareResult};

/// A producer of raw NMEA lines
pub trait NmeaSource: Send {
    /// Next available line, `Ok(None)` when nothing is ready yet
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// NMEA stream from a serial device node or a recorded log file
///
/// The device must already be configured for the receiver's baud rate.
pub struct SerialNmeaSource {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
}

impl SerialNmeaSource {
    pub fn open(path: impl AsRef<Path>) -> HardwareResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| HardwareError::InitFailed {
            reason: format!("open {}: {}", path.display(), e),
        })?;
        info!(device = %path.display(), "GPS device opened");
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NmeaSource for SerialNmeaSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(self.line.trim_end().to_string())),
            // Serial drivers report an empty read as a timeout
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Synthetic receiver reporting a 3D fix near a fixed location
///
/// Every `period` it emits a burst of GGA, GSA and RMC sentences with valid
/// checksums and a small random offset on the position.
pub struct SimulatedNmeaSource {
    center: GeoPoint,
    jitter_deg: f64,
    satellites: u32,
    period: Duration,
    next_burst: Instant,
    pending: VecDeque<String>,
}

impl SimulatedNmeaSource {
    pub fn new(center: GeoPoint, period: Duration) -> Self {
        Self {
            center,
            jitter_deg: 0.0001,
            satellites: 8,
            period,
            next_burst: Instant::now(),
            pending: VecDeque::new(),
        }
    }

    pub fn with_jitter(mut self, jitter_deg: f64) -> Self {
        self.jitter_deg = jitter_deg.abs();
        self
    }

    pub fn with_satellites(mut self, satellites: u32) -> Self {
        self.satellites = satellites;
        self
    }

    /// One burst of sentences for the given position
    pub fn burst(&self, position: GeoPoint) -> Vec<String> {
        let now = Utc::now();
        let time = now.format("%H%M%S.00").to_string();
        let date = now.format("%d%m%y").to_string();
        let (lat, ns) = nmea_coordinate(position.lat, 2, 'N', 'S');
        let (lon, ew) = nmea_coordinate(position.lon, 3, 'E', 'W');

        vec![
            with_checksum(&format!(
                "$GPGGA,{},{},{},{},{},1,{:02},0.9,35.0,M,47.0,M,,",
                time, lat, ns, lon, ew, self.satellites
            )),
            with_checksum("$GPGSA,A,3,04,05,09,12,24,25,29,31,,,,,1.8,0.9,1.5"),
            with_checksum(&format!(
                "$GPRMC,{},A,{},{},{},{},000.5,000.0,{},,,A",
                time, lat, ns, lon, ew, date
            )),
        ]
    }

    fn jittered(&self) -> GeoPoint {
        if self.jitter_deg == 0.0 {
            return self.center;
        }
        let mut rng = rand::thread_rng();
        GeoPoint::new(
            self.center.lat + rng.gen_range(-self.jitter_deg..=self.jitter_deg),
            self.center.lon + rng.gen_range(-self.jitter_deg..=self.jitter_deg),
        )
    }
}

impl NmeaSource for SimulatedNmeaSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        if self.pending.is_empty() && Instant::now() >= self.next_burst {
            let burst = self.burst(self.jittered());
            self.pending.extend(burst);
            self.next_burst = Instant::now() + self.period;
        }
        Ok(self.pending.pop_front())
    }
}

/// Encode decimal degrees as `DDMM.MMMM`/`DDDMM.MMMM` plus hemisphere
fn nmea_coordinate(value: f64, degree_digits: usize, positive: char, negative: char) -> (String, char) {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let abs = value.abs();
    let degrees = abs.trunc();
    let minutes = ((abs - degrees) * 60.0).min(59.9999);
    (
        format!("{:0width$}{:07.4}", degrees as u32, minutes, width = degree_digits),
        hemisphere,
    )
}
