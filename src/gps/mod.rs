//! GPS acquisition: NMEA decoding, fix evaluation and the reader worker

pub mod fix;
pub mod nmea;
pub mod receiver;
pub mod source;

pub use fix::{evaluate_fix, FixRejection, FixRequirements};
pub use nmea::{is_valid_nmea, nmea_checksum, NmeaError, NmeaParser, NmeaResult, Sentence};
pub use receiver::{GpsError, GpsReceiver};
pub use source::{NmeaSource, SerialNmeaSource, SimulatedNmeaSource};
