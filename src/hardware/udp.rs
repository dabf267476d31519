//! UDP datagram transceiver for running beacon and tracker without radios
//!
//! Each transmission becomes one datagram to the peer address. When no peer
//! is configured, the sender of the first received datagram is adopted as the
//! peer, so a tracker can be started without knowing the beacon's address.

use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info, warn};

use crate::hardware::transceiver::check_payload_size;
use crate::hardware::{HardwareError, HardwareResult, Transceiver, TransceiverStatus};
use crate::utils::config::{BusConfig, RadioConfig};

/// Largest datagram accepted or sent
pub const MAX_DATAGRAM: usize = 2048;

/// Fixed link figures reported in place of a radio measurement
const UDP_RSSI_DBM: f64 = -40.0;
const UDP_SNR_DB: f64 = 10.0;

pub struct UdpTransceiver {
    bind_addr: SocketAddr,
    peer: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    status: TransceiverStatus,
    buffer: Vec<u8>,
}

impl UdpTransceiver {
    pub fn new(bind_addr: SocketAddr, peer: Option<SocketAddr>) -> Self {
        Self {
            bind_addr,
            peer,
            socket: None,
            status: TransceiverStatus::default(),
            buffer: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Address actually bound, useful when binding to port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn socket(&self) -> HardwareResult<&UdpSocket> {
        self.socket.as_ref().ok_or(HardwareError::NotConnected)
    }
}

impl Transceiver for UdpTransceiver {
    fn begin(&mut self, _bus: &BusConfig) -> HardwareResult<()> {
        let socket = UdpSocket::bind(self.bind_addr).map_err(|e| HardwareError::InitFailed {
            reason: format!("bind {}: {}", self.bind_addr, e),
        })?;
        socket.set_nonblocking(true)?;
        info!(addr = %socket.local_addr()?, peer = ?self.peer, "UDP transceiver bound");
        self.socket = Some(socket);
        self.status.connected = true;
        self.status.sleeping = false;
        Ok(())
    }

    fn configure(&mut self, radio: &RadioConfig) -> HardwareResult<()> {
        radio.validate()?;
        self.socket()?;
        debug!(
            frequency_hz = radio.frequency_hz,
            sf = radio.spreading_factor,
            "Radio parameters accepted (not applicable to UDP)"
        );
        Ok(())
    }

    fn transmit(&mut self, payload: &[u8]) -> HardwareResult<()> {
        check_payload_size(payload, MAX_DATAGRAM)?;
        let peer = match self.peer {
            Some(peer) => peer,
            None => {
                // Nobody to talk to yet; the packet is lost like an unheard radio frame
                debug!("No UDP peer known, dropping {} bytes", payload.len());
                self.status.packets_sent += 1;
                return Ok(());
            }
        };

        let sent = self.socket()?.send_to(payload, peer);
        match sent {
            Ok(_) => {
                self.status.packets_sent += 1;
                self.status.sleeping = false;
                Ok(())
            }
            Err(e) => {
                self.status.error_count += 1;
                Err(HardwareError::TransmitFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn receive_poll(&mut self) -> Option<Vec<u8>> {
        if self.status.sleeping {
            return None;
        }
        let socket = self.socket.as_ref()?;
        match socket.recv_from(&mut self.buffer) {
            Ok((len, from)) => {
                if self.peer.is_none() {
                    info!(peer = %from, "UDP peer discovered");
                    self.peer = Some(from);
                }
                self.status.packets_received += 1;
                Some(self.buffer[..len].to_vec())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                self.status.error_count += 1;
                None
            }
        }
    }

    fn last_rssi_dbm(&self) -> f64 {
        UDP_RSSI_DBM
    }

    fn last_snr_db(&self) -> f64 {
        UDP_SNR_DB
    }

    fn sleep(&mut self) -> HardwareResult<()> {
        self.status.sleeping = true;
        Ok(())
    }

    fn wake(&mut self) -> HardwareResult<()> {
        self.status.sleeping = false;
        Ok(())
    }

    fn status(&self) -> TransceiverStatus {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn poll_until(radio: &mut UdpTransceiver, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(packet) = radio.receive_poll() {
                return Some(packet);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_transmit_before_begin_fails() {
        let mut radio = UdpTransceiver::new(loopback(), Some(loopback()));
        assert!(matches!(radio.transmit(b"x"), Err(HardwareError::NotConnected)));
        assert_eq!(radio.receive_poll(), None);
    }

    #[test]
    fn test_peer_discovery_and_reply() {
        let mut tracker = UdpTransceiver::new(loopback(), None);
        tracker.begin(&BusConfig::default()).unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        let mut beacon = UdpTransceiver::new(loopback(), Some(tracker_addr));
        beacon.begin(&BusConfig::default()).unwrap();
        beacon.configure(&RadioConfig::default()).unwrap();

        beacon.transmit(b"position").unwrap();
        let packet = poll_until(&mut tracker, Duration::from_secs(2));
        assert_eq!(packet, Some(b"position".to_vec()));
        assert_eq!(tracker.peer(), beacon.local_addr());

        tracker.transmit(b"ack").unwrap();
        let reply = poll_until(&mut beacon, Duration::from_secs(2));
        assert_eq!(reply, Some(b"ack".to_vec()));
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut radio = UdpTransceiver::new(loopback(), Some(loopback()));
        radio.begin(&BusConfig::default()).unwrap();
        let payload = vec![0u8; MAX_DATAGRAM + 1];
        assert!(matches!(
            radio.transmit(&payload),
            Err(HardwareError::PayloadTooLarge { .. })
        ));
    }
}
