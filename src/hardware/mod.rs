//! Hardware abstraction layer for the LoRa radio
//!
//! The protocol engine only ever talks to a [`Transceiver`]. Chip drivers stay
//! outside this crate; the mock and UDP implementations cover tests and
//! development hosts.

pub mod error;
pub mod mock;
pub mod transceiver;
pub mod udp;

pub use error::{HardwareError, HardwareResult, RecoveryStrategy};
pub use mock::MockTransceiver;
pub use transceiver::{Transceiver, TransceiverStatus, LORA_MAX_PAYLOAD};
pub use udp::UdpTransceiver;
pub use crate::utils::config::{BusConfig, RadioConfig};
