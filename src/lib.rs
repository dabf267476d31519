//! LoRa GPS Tracker
//!
//! A two-node tracking link: a battery-powered beacon reads NMEA fixes and
//! reports them over LoRa, a tracker receives them and computes distance and
//! bearing to the beacon. The protocol layer provides encrypted framing,
//! acknowledged delivery with retry and backoff, and queued worker loops.

pub mod core;
pub mod algorithms;
pub mod gps;
pub mod hardware;
pub mod protocol;
pub mod controller;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{GeoPoint, GpsFix, EARTH_RADIUS_M, BROADCAST_ID};
pub use crate::algorithms::{bearing, distance, NavigationCalculator, NavigationSnapshot};
pub use crate::gps::{GpsError, GpsReceiver, NmeaParser, NmeaSource, SerialNmeaSource, SimulatedNmeaSource};
pub use crate::hardware::{HardwareError, HardwareResult, MockTransceiver, Transceiver, TransceiverStatus, UdpTransceiver};
pub use crate::protocol::{
    DeliveryState, LoRaEngine, Message, MessageCodec, MessageSender, MessageType, Payload,
    ProtocolError, ProtocolResult, Statistics,
};
pub use crate::controller::{BeaconController, ControllerError, ControllerResult, TrackerController};
pub use crate::utils::{
    init_logging, BeaconConfig, BusConfig, ConfigError, GpsConfig, ProtocolConfig, RadioConfig,
    TrackerConfig,
};
