//! Transceiver interface trait and status

use serde::Serialize;

use crate::hardware::{HardwareError, HardwareResult};
use crate::utils::config::{BusConfig, ConfigError, RadioConfig};

/// Largest payload a LoRa packet can carry
pub const LORA_MAX_PAYLOAD: usize = 255;

/// Hardware abstraction trait for LoRa radio modules
///
/// Implementations own the physical link. The protocol engine drives them
/// from two threads behind a mutex, so every call must return promptly:
/// `transmit` blocks only until the packet is on air and `receive_poll`
/// never blocks.
pub trait Transceiver: Send {
    /// Bring up the bus and reset the chip
    fn begin(&mut self, bus: &BusConfig) -> HardwareResult<()>;

    /// Apply modem parameters
    fn configure(&mut self, radio: &RadioConfig) -> HardwareResult<()>;

    /// Send one packet, returning once transmission has completed
    fn transmit(&mut self, payload: &[u8]) -> HardwareResult<()>;

    /// Return a received packet if one is ready
    fn receive_poll(&mut self) -> Option<Vec<u8>>;

    /// RSSI of the last received packet (dBm)
    fn last_rssi_dbm(&self) -> f64;

    /// SNR of the last received packet (dB)
    fn last_snr_db(&self) -> f64;

    /// Enter low-power standby
    fn sleep(&mut self) -> HardwareResult<()>;

    fn wake(&mut self) -> HardwareResult<()>;

    fn status(&self) -> TransceiverStatus;
}

/// Transceiver status information
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransceiverStatus {
    pub connected: bool,
    pub sleeping: bool,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub error_count: u32,
}

impl TransceiverStatus {
    pub fn is_healthy(&self) -> bool {
        self.connected && self.error_count < 10
    }
}

impl From<ConfigError> for HardwareError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidParameter { parameter, value, .. } => {
                HardwareError::ConfigurationError { parameter, value }
            }
        }
    }
}

/// Reject payloads larger than `max`
pub fn check_payload_size(payload: &[u8], max: usize) -> HardwareResult<()> {
    if payload.len() > max {
        return Err(HardwareError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_health() {
        let mut status = TransceiverStatus {
            connected: true,
            ..Default::default()
        };
        assert!(status.is_healthy());
        status.error_count = 10;
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_config_error_maps_to_hardware_error() {
        let radio = RadioConfig {
            coding_rate: 9,
            ..Default::default()
        };
        let err: HardwareError = radio.validate().unwrap_err().into();
        assert!(matches!(err, HardwareError::ConfigurationError { ref parameter, .. } if parameter == "coding_rate"));
    }

    #[test]
    fn test_payload_size_check() {
        assert!(check_payload_size(&[0u8; 255], LORA_MAX_PAYLOAD).is_ok());
        assert!(matches!(
            check_payload_size(&[0u8; 256], LORA_MAX_PAYLOAD),
            Err(HardwareError::PayloadTooLarge { size: 256, max: 255 })
        ));
    }
}
