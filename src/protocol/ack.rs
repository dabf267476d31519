//! Pending acknowledgments and per-message delivery state

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Lifecycle of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Transmitting,
    AckPending,
    Retrying,
    /// Terminal: acknowledged by the peer
    Acked,
    /// Terminal: retries used up without an acknowledgment
    Exhausted,
    /// Terminal: transmitted, no acknowledgment requested
    Sent,
    /// Terminal: the radio rejected the transmission
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Acked | DeliveryState::Exhausted | DeliveryState::Sent | DeliveryState::Failed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Sent)
    }
}

/// Message id to wait handle for every send awaiting its ACK
#[derive(Debug, Default)]
pub struct PendingAcks {
    waiters: Mutex<HashMap<String, Sender<()>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `message_id`; the receiver fires once when its ACK arrives
    pub fn register(&self, message_id: &str) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.waiters.lock().insert(message_id.to_string(), tx);
        rx
    }

    /// Signal the waiter for `ack_id`; false when nothing was waiting
    pub fn resolve(&self, ack_id: &str) -> bool {
        match self.waiters.lock().remove(ack_id) {
            Some(tx) => {
                let _ = tx.try_send(());
                true
            }
            None => false,
        }
    }

    pub fn discard(&self, message_id: &str) {
        self.waiters.lock().remove(message_id);
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.waiters.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct LogInner {
    states: HashMap<String, DeliveryState>,
    order: VecDeque<String>,
}

/// Bounded record of recent delivery states, oldest evicted first
#[derive(Debug)]
pub struct DeliveryLog {
    capacity: usize,
    inner: Mutex<LogInner>,
    changed: Condvar,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner::default()),
            changed: Condvar::new(),
        }
    }

    pub fn set(&self, message_id: &str, state: DeliveryState) {
        let mut inner = self.inner.lock();
        if inner.states.insert(message_id.to_string(), state).is_none() {
            inner.order.push_back(message_id.to_string());
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.states.remove(&oldest);
                }
            }
        }
        drop(inner);
        self.changed.notify_all();
    }

    pub fn remove(&self, message_id: &str) {
        let mut inner = self.inner.lock();
        if inner.states.remove(message_id).is_some() {
            inner.order.retain(|id| id != message_id);
        }
    }

    pub fn get(&self, message_id: &str) -> Option<DeliveryState> {
        self.inner.lock().states.get(message_id).copied()
    }

    /// Block until `message_id` reaches a terminal state or `timeout` passes
    ///
    /// Returns the last known state, `None` if the id was never recorded
    /// or has been evicted.
    pub fn wait_for(&self, message_id: &str, timeout: Duration) -> Option<DeliveryState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let state = inner.states.get(message_id).copied();
            if state.map_or(false, |s| s.is_terminal()) {
                return state;
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.states.get(message_id).copied();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
