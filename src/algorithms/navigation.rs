//! Tracker-to-beacon navigation state
//!
//! Every position update on either side recomputes distance and bearing once
//! both positions are known, and appends the result to bounded histories.
//! Trends are ordinary least-squares slopes over the most recent samples;
//! bearings are unwrapped into a continuous series first so that a crossing
//! of north does not read as a full turn.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::algorithms::geo::{bearing, cardinal_direction, distance};
use crate::core::{epoch_seconds, GeoPoint};

/// Default number of samples kept per history
pub const DEFAULT_HISTORY_SIZE: usize = 20;

/// Number of most recent samples used for trend estimation
pub const TREND_WINDOW: usize = 5;

/// A (timestamp, value) sample
pub type Sample = (f64, f64);

/// Point-in-time view of the navigation state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationSnapshot {
    pub tracker_position: Option<GeoPoint>,
    pub beacon_position: Option<GeoPoint>,
    /// Meters from tracker to beacon
    pub distance: Option<f64>,
    /// Degrees from tracker to beacon
    pub bearing: Option<f64>,
    /// Meters per second, negative when closing in
    pub distance_trend: Option<f64>,
    /// Degrees per second, positive when the bearing turns clockwise
    pub bearing_trend: Option<f64>,
    pub last_calc_time: Option<f64>,
}

/// Distance/bearing calculator with bounded sample history
#[derive(Debug, Clone)]
pub struct NavigationCalculator {
    tracker_position: Option<GeoPoint>,
    beacon_position: Option<GeoPoint>,
    distance: Option<f64>,
    bearing: Option<f64>,
    last_calc_time: Option<f64>,
    distance_history: VecDeque<Sample>,
    bearing_history: VecDeque<Sample>,
    max_history: usize,
}

impl NavigationCalculator {
    pub fn new() -> Self {
        Self::with_history_size(DEFAULT_HISTORY_SIZE)
    }

    pub fn with_history_size(max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            tracker_position: None,
            beacon_position: None,
            distance: None,
            bearing: None,
            last_calc_time: None,
            distance_history: VecDeque::with_capacity(max_history),
            bearing_history: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    pub fn update_tracker_position(&mut self, lat: f64, lon: f64) {
        self.update_tracker_position_at(lat, lon, epoch_seconds());
    }

    pub fn update_beacon_position(&mut self, lat: f64, lon: f64) {
        self.update_beacon_position_at(lat, lon, epoch_seconds());
    }

    /// Update the tracker side with an explicit sample timestamp
    pub fn update_tracker_position_at(&mut self, lat: f64, lon: f64, timestamp: f64) {
        self.tracker_position = Some(GeoPoint::new(lat, lon));
        self.recalculate(timestamp);
    }

    /// Update the beacon side with an explicit sample timestamp
    pub fn update_beacon_position_at(&mut self, lat: f64, lon: f64, timestamp: f64) {
        self.beacon_position = Some(GeoPoint::new(lat, lon));
        self.recalculate(timestamp);
    }

    pub fn tracker_position(&self) -> Option<GeoPoint> {
        self.tracker_position
    }

    pub fn beacon_position(&self) -> Option<GeoPoint> {
        self.beacon_position
    }

    pub fn distance(&self) -> Option<f64> {
        self.distance
    }

    pub fn bearing(&self) -> Option<f64> {
        self.bearing
    }

    pub fn distance_history(&self) -> impl Iterator<Item = &Sample> {
        self.distance_history.iter()
    }

    pub fn bearing_history(&self) -> impl Iterator<Item = &Sample> {
        self.bearing_history.iter()
    }

    fn recalculate(&mut self, timestamp: f64) {
        let (tracker, beacon) = match (self.tracker_position, self.beacon_position) {
            (Some(t), Some(b)) => (t, b),
            _ => {
                self.distance = None;
                self.bearing = None;
                return;
            }
        };

        let d = distance(tracker.lat, tracker.lon, beacon.lat, beacon.lon);
        let b = bearing(tracker.lat, tracker.lon, beacon.lat, beacon.lon);
        self.distance = Some(d);
        self.bearing = Some(b);
        self.last_calc_time = Some(timestamp);

        push_bounded(&mut self.distance_history, (timestamp, d), self.max_history);
        push_bounded(&mut self.bearing_history, (timestamp, b), self.max_history);

        debug!(distance_m = d, bearing_deg = b, "Navigation update");
    }

    /// Rate of change of distance (m/s) over the recent window
    pub fn distance_trend(&self) -> Option<f64> {
        let window = recent(&self.distance_history);
        if window.len() < 2 {
            return None;
        }
        regression_slope(&window)
    }

    /// Rate of change of bearing (deg/s) over the recent window
    pub fn bearing_trend(&self) -> Option<f64> {
        let window = recent(&self.bearing_history);
        if window.len() < 2 {
            return None;
        }
        regression_slope(&unwrap_bearings(&window))
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        NavigationSnapshot {
            tracker_position: self.tracker_position,
            beacon_position: self.beacon_position,
            distance: self.distance,
            bearing: self.bearing,
            distance_trend: self.distance_trend(),
            bearing_trend: self.bearing_trend(),
            last_calc_time: self.last_calc_time,
        }
    }

    /// `"850.0 m"` below one kilometer, `"1.25 km"` above
    pub fn formatted_distance(&self) -> String {
        match self.distance {
            None => "N/A".to_string(),
            Some(d) if d < 1000.0 => format!("{:.1} m", d),
            Some(d) => format!("{:.2} km", d / 1000.0),
        }
    }

    /// `"42.0° (NE)"`
    pub fn formatted_bearing(&self) -> String {
        match self.bearing {
            None => "N/A".to_string(),
            Some(b) => format!("{:.1}° ({})", b, cardinal_direction(b)),
        }
    }
}

impl Default for NavigationCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(history: &mut VecDeque<Sample>, sample: Sample, max: usize) {
    while history.len() >= max {
        history.pop_front();
    }
    history.push_back(sample);
}

fn recent(history: &VecDeque<Sample>) -> Vec<Sample> {
    let skip = history.len().saturating_sub(TREND_WINDOW);
    history.iter().skip(skip).copied().collect()
}

/// Replace each bearing by its predecessor plus the signed shortest-path delta
pub fn unwrap_bearings(samples: &[Sample]) -> Vec<Sample> {
    let mut unwrapped = Vec::with_capacity(samples.len());
    let mut previous: Option<f64> = None;

    for &(t, b) in samples {
        let value = match previous {
            None => b,
            Some(prev) => {
                let delta = (b - prev + 180.0).rem_euclid(360.0) - 180.0;
                prev + delta
            }
        };
        unwrapped.push((t, value));
        previous = Some(value);
    }

    unwrapped
}

/// OLS slope of value against time; `None` when all timestamps coincide
pub fn regression_slope(samples: &[Sample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }

    let n = samples.len() as f64;
    let mean_t = samples.iter().map(|s| s.0).sum::<f64>() / n;
    let mean_v = samples.iter().map(|s| s.1).sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for &(t, v) in samples {
        let dt = t - mean_t;
        covariance += dt * (v - mean_v);
        variance += dt * dt;
    }

    if variance == 0.0 {
        return None;
    }
    Some(covariance / variance)
}
