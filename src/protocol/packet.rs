//! 12-byte binary position packet
//!
//! Layout, little-endian: `i32` latitude in micro-degrees, `i32` longitude in
//! micro-degrees, `u32` Unix timestamp. Used when airtime is too scarce for a
//! JSON envelope; it carries no sender, destination or id.

use crate::protocol::error::{ProtocolError, ProtocolResult};

pub const MINIMAL_PACKET_LEN: usize = 12;

/// Compact position report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalPacket {
    pub lat_micro_deg: i32, // Latitude * 1e6
    pub lon_micro_deg: i32, // Longitude * 1e6
    pub timestamp: u32,
}

impl MinimalPacket {
    pub fn new(lat: f64, lon: f64, timestamp: u32) -> Self {
        Self {
            lat_micro_deg: (lat * 1_000_000.0).round() as i32,
            lon_micro_deg: (lon * 1_000_000.0).round() as i32,
            timestamp,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.lat_micro_deg as f64 / 1_000_000.0
    }

    pub fn longitude(&self) -> f64 {
        self.lon_micro_deg as f64 / 1_000_000.0
    }

    pub fn to_bytes(&self) -> [u8; MINIMAL_PACKET_LEN] {
        let mut bytes = [0u8; MINIMAL_PACKET_LEN];
        bytes[0..4].copy_from_slice(&self.lat_micro_deg.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.lon_micro_deg.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let bytes: &[u8; MINIMAL_PACKET_LEN] =
            bytes.try_into().map_err(|_| ProtocolError::MalformedPayload {
                reason: format!(
                    "minimal packet must be {} bytes, got {}",
                    MINIMAL_PACKET_LEN,
                    bytes.len()
                ),
            })?;

        let lat = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let lon = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let timestamp = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        if !(-90_000_000..=90_000_000).contains(&lat) || !(-180_000_000..=180_000_000).contains(&lon) {
            return Err(ProtocolError::MalformedPayload {
                reason: format!("coordinates out of range: {}, {}", lat, lon),
            });
        }

        Ok(Self {
            lat_micro_deg: lat,
            lon_micro_deg: lon,
            timestamp,
        })
    }
}

pub fn encode_minimal(lat: f64, lon: f64, timestamp: u32) -> [u8; MINIMAL_PACKET_LEN] {
    MinimalPacket::new(lat, lon, timestamp).to_bytes()
}

pub fn decode_minimal(bytes: &[u8]) -> ProtocolResult<(f64, f64, u32)> {
    let packet = MinimalPacket::from_bytes(bytes)?;
    Ok((packet.latitude(), packet.longitude(), packet.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_round_trip() {
        let bytes = encode_minimal(51.5074, -0.1278, 1_700_000_000);
        assert_eq!(bytes.len(), MINIMAL_PACKET_LEN);

        let (lat, lon, ts) = decode_minimal(&bytes).unwrap();
        assert!((lat - 51.5074).abs() < 1e-6);
        assert!((lon + 0.1278).abs() < 1e-6);
        assert_eq!(ts, 1_700_000_000);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let bytes = encode_minimal(0.000001, -0.000001, 1);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_rounding_not_truncation() {
        let packet = MinimalPacket::new(0.0, 0.1278, 0);
        assert_eq!(packet.lon_micro_deg, 127_800);
        let packet = MinimalPacket::new(0.0000016, 0.0, 0);
        assert_eq!(packet.lat_micro_deg, 2);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            decode_minimal(&[0u8; 11]),
            Err(ProtocolError::MalformedPayload { .. })
        ));
        assert!(decode_minimal(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut bytes = encode_minimal(0.0, 0.0, 0);
        bytes[0..4].copy_from_slice(&100_000_000i32.to_le_bytes());
        assert!(decode_minimal(&bytes).is_err());
    }
}
