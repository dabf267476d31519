//! Typed configuration for the radio, protocol, GPS and both controllers
//!
//! Every struct carries the field defaults of a deployed beacon/tracker pair
//! and a `validate()` that rejects values the hardware or protocol cannot
//! honour. Timings are stored in milliseconds, with `Duration` accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::GeoPoint;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid {parameter} = {value}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// LoRa modem parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Carrier frequency (Hz)
    pub frequency_hz: u32,
    /// Signal bandwidth (Hz)
    pub bandwidth_hz: u32,
    /// Spreading factor (5-12)
    pub spreading_factor: u8,
    /// Coding rate denominator, 4/5 through 4/8
    pub coding_rate: u8,
    /// Preamble length in symbols
    pub preamble_len: u16,
    pub sync_word: u8,
    pub crc_enabled: bool,
    /// Output power (dBm)
    pub tx_power_dbm: i8,
    /// PA over-current protection (mA)
    pub current_limit_ma: u16,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 868_000_000,
            bandwidth_hz: 125_000,
            spreading_factor: 7,
            coding_rate: 5,
            preamble_len: 8,
            sync_word: 0x12,
            crc_enabled: true,
            tx_power_dbm: 20,
            current_limit_ma: 100,
        }
    }
}

impl RadioConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(150_000_000..=960_000_000).contains(&self.frequency_hz) {
            return Err(invalid("frequency_hz", self.frequency_hz, "outside 150-960 MHz"));
        }
        if !(5..=12).contains(&self.spreading_factor) {
            return Err(invalid("spreading_factor", self.spreading_factor, "must be 5-12"));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(invalid("coding_rate", self.coding_rate, "must be 5-8"));
        }
        if !(-9..=22).contains(&self.tx_power_dbm) {
            return Err(invalid("tx_power_dbm", self.tx_power_dbm, "must be -9 to 22 dBm"));
        }
        if self.bandwidth_hz == 0 {
            return Err(invalid("bandwidth_hz", self.bandwidth_hz, "must be non-zero"));
        }
        Ok(())
    }
}

/// SPI bus and control pin assignment for the radio module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub spi_bus: u8,
    pub spi_cs: u8,
    pub reset_pin: i32,
    pub busy_pin: i32,
    pub irq_pin: i32,
    pub txen_pin: i32,
    /// -1 when RX enable is not wired
    pub rxen_pin: i32,
    pub spi_speed_hz: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            spi_bus: 0,
            spi_cs: 0,
            reset_pin: 18,
            busy_pin: 20,
            irq_pin: 16,
            txen_pin: 6,
            rxen_pin: -1,
            spi_speed_hz: 1_000_000,
        }
    }
}

/// Messaging protocol parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Identifier this node sends as and accepts messages for
    pub node_id: String,
    /// Default destination for outbound messages
    pub destination_id: String,
    /// Shared AES key; `None` or empty disables encryption
    pub encryption_key: Option<String>,
    /// Capacity of the send and receive queues
    pub queue_size: usize,
    /// Minimum spacing between transmissions (ms)
    pub tx_interval_ms: u64,
    pub ack_timeout_ms: u64,
    /// Retransmissions after the first attempt
    pub max_retries: u32,
    /// Backoff base; attempt n waits `base * 2^n`
    pub retry_base_delay_ms: u64,
    pub rx_poll_interval_ms: u64,
    /// Pause after an unexpected failure inside a worker loop (ms)
    pub error_backoff_ms: u64,
    /// Maximum time to wait for workers to stop (ms)
    pub shutdown_grace_ms: u64,
    /// Number of delivery verdicts retained for lookup
    pub delivery_log_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            node_id: "TRACKER01".to_string(),
            destination_id: "SERVER".to_string(),
            encryption_key: Some("0123456789ABCDEF".to_string()),
            queue_size: 20,
            tx_interval_ms: 100,
            ack_timeout_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            rx_poll_interval_ms: 1,
            error_backoff_ms: 1000,
            shutdown_grace_ms: 2000,
            delivery_log_size: 64,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_id.is_empty() {
            return Err(invalid("node_id", "", "must not be empty"));
        }
        if self.queue_size == 0 {
            return Err(invalid("queue_size", self.queue_size, "must be at least 1"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(invalid("ack_timeout_ms", self.ack_timeout_ms, "must be non-zero"));
        }
        if self.delivery_log_size == 0 {
            return Err(invalid("delivery_log_size", self.delivery_log_size, "must be at least 1"));
        }
        Ok(())
    }

    pub fn tx_interval(&self) -> Duration {
        Duration::from_millis(self.tx_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn rx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rx_poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// GPS acquisition and fix-quality parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsConfig {
    pub min_satellites: u32,
    pub max_hdop: f64,
    pub require_3d_fix: bool,
    /// How often fix validity is re-evaluated (ms)
    pub evaluation_interval_ms: u64,
    /// Poll interval of `wait_for_fix` (ms)
    pub fix_poll_interval_ms: u64,
    /// Sleep when the sentence source has nothing to read (ms)
    pub read_idle_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            min_satellites: 3,
            max_hdop: 5.0,
            require_3d_fix: false,
            evaluation_interval_ms: 1000,
            fix_poll_interval_ms: 500,
            read_idle_ms: 10,
            shutdown_grace_ms: 2000,
        }
    }
}

impl GpsConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.max_hdop > 0.0) {
            return Err(invalid("max_hdop", self.max_hdop, "must be positive"));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(invalid(
                "evaluation_interval_ms",
                self.evaluation_interval_ms,
                "must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn fix_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fix_poll_interval_ms)
    }

    pub fn read_idle(&self) -> Duration {
        Duration::from_millis(self.read_idle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Circular geofence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_m: f64,
}

/// Beacon reporting behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Maximum time between position reports (ms)
    pub position_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Movement that triggers an early position report (m)
    pub position_change_threshold_m: f64,
    pub geofence: Option<Geofence>,
    /// Distance at which a waypoint counts as reached (m)
    pub waypoint_radius_m: f64,
    /// Battery percentage at or below which an alert is raised
    pub low_battery_threshold: f64,
    pub low_power_mode: bool,
    /// Main loop tick (ms)
    pub loop_interval_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            position_interval_ms: 60_000,
            heartbeat_interval_ms: 300_000,
            position_change_threshold_m: 10.0,
            geofence: None,
            waypoint_radius_m: 100.0,
            low_battery_threshold: 20.0,
            low_power_mode: false,
            loop_interval_ms: 1000,
        }
    }
}

impl BeaconConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.position_interval_ms == 0 {
            return Err(invalid(
                "position_interval_ms",
                self.position_interval_ms,
                "must be non-zero",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid(
                "heartbeat_interval_ms",
                self.heartbeat_interval_ms,
                "must be non-zero",
            ));
        }
        if self.position_change_threshold_m < 0.0 {
            return Err(invalid(
                "position_change_threshold_m",
                self.position_change_threshold_m,
                "must not be negative",
            ));
        }
        if let Some(fence) = &self.geofence {
            if !(fence.radius_m > 0.0) {
                return Err(invalid("geofence.radius_m", fence.radius_m, "must be positive"));
            }
        }
        if !(0.0..=100.0).contains(&self.low_battery_threshold) {
            return Err(invalid(
                "low_battery_threshold",
                self.low_battery_threshold,
                "must be a percentage",
            ));
        }
        Ok(())
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }
}

/// Tracker behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Replace the radio receive path with a synthetic beacon
    pub simulate: bool,
    pub simulated_location: GeoPoint,
    /// Maximum random offset applied to each synthetic fix (degrees)
    pub simulation_jitter_deg: f64,
    pub simulation_period_ms: u64,
    pub history_size: usize,
    /// Interval of the periodic navigation status log (ms)
    pub status_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            simulated_location: GeoPoint::new(51.5074, -0.1278),
            simulation_jitter_deg: 0.0001,
            simulation_period_ms: 5000,
            history_size: 20,
            status_interval_ms: 1000,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.history_size < 2 {
            return Err(invalid("history_size", self.history_size, "trends need two samples"));
        }
        if self.simulation_period_ms == 0 {
            return Err(invalid(
                "simulation_period_ms",
                self.simulation_period_ms,
                "must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn simulation_period(&self) -> Duration {
        Duration::from_millis(self.simulation_period_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}
