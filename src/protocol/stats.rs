//! Link statistics

use serde::{Deserialize, Serialize};

/// Counters shared by the engine's workers
///
/// Counters only ever increase; RSSI and SNR hold the last observed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    /// Messages delivered (acknowledged, or sent when no ACK was requested)
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Messages that exhausted their retries or could not be transmitted
    pub tx_errors: u64,
    /// Received packets that could not be decoded
    pub rx_errors: u64,
    /// Retransmissions after a missing ACK
    pub retries: u64,
    pub acks_received: u64,
    /// Inbound messages lost to a full receive queue
    pub rx_dropped: u64,
    pub rssi: f64,
    pub snr: f64,
}

impl Statistics {
    /// Fraction of finished sends that succeeded, `None` before any send
    pub fn delivery_ratio(&self) -> Option<f64> {
        let finished = self.tx_packets + self.tx_errors;
        if finished == 0 {
            None
        } else {
            Some(self.tx_packets as f64 / finished as f64)
        }
    }

    pub(crate) fn record_rx(&mut self, bytes: usize, rssi: f64, snr: f64) {
        self.rx_packets += 1;
        self.rx_bytes += bytes as u64;
        self.rssi = rssi;
        self.snr = snr;
    }
}
