//! Utility modules for configuration and logging

pub mod config;
pub mod logging;

pub use config::{
    BeaconConfig, BusConfig, ConfigError, ConfigResult, Geofence, GpsConfig, ProtocolConfig,
    RadioConfig, TrackerConfig,
};
pub use logging::init_logging;
