//! Mock transceiver implementation for testing and development
//!
//! A `MockTransceiver` is a cheap handle onto shared state, so a test can keep
//! one clone for inspection while the protocol engine owns another. Two mocks
//! joined with [`MockTransceiver::pair`] deliver each other's transmissions,
//! which stands in for the radio link.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;

use crate::hardware::transceiver::check_payload_size;
use crate::hardware::{HardwareError, HardwareResult, Transceiver, TransceiverStatus};
use crate::utils::config::{BusConfig, RadioConfig};

#[derive(Debug)]
struct MockState {
    status: TransceiverStatus,
    radio: Option<RadioConfig>,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    peer: Option<Weak<Mutex<MockState>>>,
    fail_begin: bool,
    fail_transmit: bool,
    drop_outgoing: bool,
    error_probability: f32,
    max_payload: Option<usize>,
    rssi_dbm: f64,
    snr_db: f64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            status: TransceiverStatus::default(),
            radio: None,
            inbox: VecDeque::new(),
            sent: Vec::new(),
            peer: None,
            fail_begin: false,
            fail_transmit: false,
            drop_outgoing: false,
            error_probability: 0.0,
            max_payload: None,
            rssi_dbm: -60.0,
            snr_db: 9.5,
        }
    }
}

/// Mock transceiver for testing and development
#[derive(Debug, Clone, Default)]
pub struct MockTransceiver {
    state: Arc<Mutex<MockState>>,
}

impl MockTransceiver {
    /// Create a new mock transceiver with no link partner
    pub fn new() -> Self {
        Self::default()
    }

    /// Create two transceivers that receive each other's transmissions
    pub fn pair() -> (Self, Self) {
        let a = Self::new();
        let b = Self::new();
        a.state.lock().peer = Some(Arc::downgrade(&b.state));
        b.state.lock().peer = Some(Arc::downgrade(&a.state));
        (a, b)
    }

    /// Queue a packet as if it had arrived over the air
    pub fn inject(&self, packet: Vec<u8>) {
        self.state.lock().inbox.push_back(packet);
    }

    /// All packets transmitted so far
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent_packets(&self) {
        self.state.lock().sent.clear();
    }

    pub fn queued_packet_count(&self) -> usize {
        self.state.lock().inbox.len()
    }

    /// Modem parameters from the last successful `configure`
    pub fn radio_config(&self) -> Option<RadioConfig> {
        self.state.lock().radio.clone()
    }

    /// Make the next `begin` calls fail
    pub fn fail_begin(&self, fail: bool) {
        self.state.lock().fail_begin = fail;
    }

    /// Make every transmit fail
    pub fn fail_transmit(&self, fail: bool) {
        self.state.lock().fail_transmit = fail;
    }

    /// Transmit succeeds locally but nothing reaches the peer
    pub fn drop_outgoing(&self, drop: bool) {
        self.state.lock().drop_outgoing = drop;
    }

    /// Fail transmissions at random with the given probability (0.0 to 1.0)
    pub fn simulate_errors(&self, probability: f32) {
        self.state.lock().error_probability = probability.clamp(0.0, 1.0);
    }

    pub fn set_max_payload(&self, max: Option<usize>) {
        self.state.lock().max_payload = max;
    }

    pub fn set_signal(&self, rssi_dbm: f64, snr_db: f64) {
        let mut state = self.state.lock();
        state.rssi_dbm = rssi_dbm;
        state.snr_db = snr_db;
    }

    /// Simulate connection loss
    pub fn disconnect(&self) {
        self.state.lock().status.connected = false;
    }

    fn should_simulate_error(probability: f32) -> bool {
        if probability <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f32>() < probability
    }
}

impl Transceiver for MockTransceiver {
    fn begin(&mut self, _bus: &BusConfig) -> HardwareResult<()> {
        let mut state = self.state.lock();
        if state.fail_begin {
            return Err(HardwareError::InitFailed {
                reason: "mock radio did not respond".to_string(),
            });
        }
        state.status.connected = true;
        state.status.sleeping = false;
        Ok(())
    }

    fn configure(&mut self, radio: &RadioConfig) -> HardwareResult<()> {
        radio.validate()?;
        let mut state = self.state.lock();
        if !state.status.connected {
            return Err(HardwareError::NotConnected);
        }
        state.radio = Some(radio.clone());
        Ok(())
    }

    fn transmit(&mut self, payload: &[u8]) -> HardwareResult<()> {
        let peer = {
            let mut state = self.state.lock();
            if !state.status.connected {
                return Err(HardwareError::NotConnected);
            }
            if let Some(max) = state.max_payload {
                check_payload_size(payload, max)?;
            }
            if state.fail_transmit || Self::should_simulate_error(state.error_probability) {
                state.status.error_count += 1;
                return Err(HardwareError::TransmitFailed {
                    reason: "simulated transmit failure".to_string(),
                });
            }
            state.status.sleeping = false;
            state.status.packets_sent += 1;
            state.sent.push(payload.to_vec());
            if state.drop_outgoing {
                None
            } else {
                state.peer.clone()
            }
        };

        // Own lock released first; the peer may be transmitting toward us
        if let Some(peer) = peer.and_then(|weak| weak.upgrade()) {
            peer.lock().inbox.push_back(payload.to_vec());
        }
        Ok(())
    }

    fn receive_poll(&mut self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.status.connected || state.status.sleeping {
            return None;
        }
        let packet = state.inbox.pop_front()?;
        state.status.packets_received += 1;
        Some(packet)
    }

    fn last_rssi_dbm(&self) -> f64 {
        self.state.lock().rssi_dbm
    }

    fn last_snr_db(&self) -> f64 {
        self.state.lock().snr_db
    }

    fn sleep(&mut self) -> HardwareResult<()> {
        self.state.lock().status.sleeping = true;
        Ok(())
    }

    fn wake(&mut self) -> HardwareResult<()> {
        self.state.lock().status.sleeping = false;
        Ok(())
    }

    fn status(&self) -> TransceiverStatus {
        self.state.lock().status.clone()
    }
}
