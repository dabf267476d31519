//! Physical constants and protocol sentinels

/// Mean Earth radius used by the haversine formula (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Conversion factor from knots to km/h
pub const KNOTS_TO_KMH: f64 = 1.852;

/// Destination id that every node accepts
pub const BROADCAST_ID: &str = "broadcast";

/// Source id attached to messages synthesised from minimal binary packets
pub const UNKNOWN_SENDER_ID: &str = "unknown";

/// Fix type reported by GSA when a 3D solution is available
pub const FIX_TYPE_3D: u8 = 3;

/// Dilution-of-precision value used before the receiver reports one
pub const DOP_UNKNOWN: f64 = 99.9;
