//! LoRa protocol engine
//!
//! Two long-running workers share one radio:
//!
//! * the receive loop polls the transceiver, decodes frames, resolves pending
//!   ACKs, dispatches each message to its registered handler on a short-lived
//!   thread (or, for types without a handler, onto the bounded queue read by
//!   [`LoRaEngine::poll_message`]) and queues acknowledgments for messages
//!   that asked for one;
//! * the send loop drains the bounded outbound queue one message at a time,
//!   runs the transmit/ACK/retry sequence and then waits the configured
//!   spacing before the next transmission.
//!
//! Outbound ACKs travel on their own queue and are drained ahead of regular
//! traffic, including while the send loop is itself waiting for an ACK, so two
//! engines waiting on each other never deadlock.
//!
//! State is split per aggregate: statistics, the pending-ack table, the
//! delivery log, the handler table and the radio each sit behind their own lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::hardware::{RecoveryStrategy, Transceiver, TransceiverStatus};
use crate::protocol::ack::{DeliveryLog, DeliveryState, PendingAcks};
use crate::protocol::codec::{Frame, MessageCodec};
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::message::{Message, MessageIdGenerator, MessageType, Payload};
use crate::protocol::packet::MinimalPacket;
use crate::protocol::stats::Statistics;
use crate::utils::config::{BusConfig, ProtocolConfig, RadioConfig};

/// Longest uninterrupted wait inside a worker; bounds stop latency
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Callback for one message type, run on its own thread per message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Inbound message with the link quality it arrived at
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message: Message,
    pub rssi: f64,
    pub snr: f64,
}

enum Outbound {
    Message(Message),
    Minimal { id: String, packet: MinimalPacket },
}

enum AckWait {
    Acked,
    TimedOut,
    Stopped,
}

struct EngineShared {
    config: ProtocolConfig,
    codec: MessageCodec,
    ids: MessageIdGenerator,
    radio: Mutex<Box<dyn Transceiver>>,
    stats: Mutex<Statistics>,
    pending: PendingAcks,
    deliveries: DeliveryLog,
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    outbound_tx: Sender<Outbound>,
    outbound_rx: Receiver<Outbound>,
    acks_tx: Sender<Message>,
    acks_rx: Receiver<Message>,
    inbox_tx: Sender<ReceivedMessage>,
    inbox_rx: Receiver<ReceivedMessage>,
    connected: AtomicBool,
    running: AtomicBool,
}

impl EngineShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`; false if a stop was requested meanwhile
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn enqueue(&self, payload: Payload, dst: Option<&str>, ack_req: bool) -> ProtocolResult<String> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let dst = dst.unwrap_or(self.config.destination_id.as_str());
        let message = Message::new(self.ids.next_id(), &self.config.node_id, dst, payload, ack_req);
        let id = message.id.clone();
        let kind = message.message_type();

        // Recorded first: the send loop may pick the message up immediately
        self.deliveries.set(&id, DeliveryState::Queued);
        match self.outbound_tx.try_send(Outbound::Message(message)) {
            Ok(()) => {
                debug!(message_id = %id, %kind, dst, ack_req, "Message queued");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.deliveries.remove(&id);
                warn!(%kind, capacity = self.config.queue_size, "Send queue full");
                Err(ProtocolError::QueueFull {
                    capacity: self.config.queue_size,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.deliveries.remove(&id);
                Err(ProtocolError::NotStarted)
            }
        }
    }

    fn enqueue_minimal(&self, packet: MinimalPacket) -> ProtocolResult<String> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let id = format!("minimal_{}", self.ids.next_id());
        self.deliveries.set(&id, DeliveryState::Queued);
        let outbound = Outbound::Minimal {
            id: id.clone(),
            packet,
        };
        match self.outbound_tx.try_send(outbound) {
            Ok(()) => Ok(id),
            Err(_) => {
                self.deliveries.remove(&id);
                warn!(capacity = self.config.queue_size, "Send queue full");
                Err(ProtocolError::QueueFull {
                    capacity: self.config.queue_size,
                })
            }
        }
    }

    /// Put `bytes` on air; every successful transmission counts toward `tx_bytes`
    fn transmit(&self, bytes: &[u8]) -> ProtocolResult<()> {
        self.radio.lock().transmit(bytes)?;
        self.stats.lock().tx_bytes += bytes.len() as u64;
        Ok(())
    }

    fn record_delivered(&self) {
        self.stats.lock().tx_packets += 1;
    }

    /// Counters first: waiters on the delivery log read them once woken
    fn record_failure(&self, message_id: &str, state: DeliveryState) {
        self.stats.lock().tx_errors += 1;
        self.deliveries.set(message_id, state);
    }
}

/// Cloneable handle for queueing messages from handlers and controllers
///
/// Holds the engine weakly, so a handler capturing a sender does not keep the
/// engine alive; sends after the engine is dropped fail with `NotConnected`.
#[derive(Clone)]
pub struct MessageSender {
    shared: Weak<EngineShared>,
    node_id: String,
}

impl MessageSender {
    fn upgrade(&self) -> ProtocolResult<Arc<EngineShared>> {
        self.shared.upgrade().ok_or(ProtocolError::NotConnected)
    }

    /// Queue a message; `None` destination uses the configured default
    pub fn send(&self, payload: Payload, dst: Option<&str>, ack_req: bool) -> ProtocolResult<String> {
        self.upgrade()?.enqueue(payload, dst, ack_req)
    }

    /// Queue a 12-byte minimal position packet
    pub fn send_minimal(&self, lat: f64, lon: f64, timestamp: u32) -> ProtocolResult<String> {
        self.upgrade()?
            .enqueue_minimal(MinimalPacket::new(lat, lon, timestamp))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn statistics(&self) -> Statistics {
        match self.shared.upgrade() {
            Some(shared) => {
                let stats = shared.stats.lock().clone();
                stats
            }
            None => Statistics::default(),
        }
    }
}

struct Worker {
    name: &'static str,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Reliable messaging over a [`Transceiver`]
pub struct LoRaEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<Worker>>,
}

impl LoRaEngine {
    pub fn new(config: ProtocolConfig, radio: Box<dyn Transceiver>) -> ProtocolResult<Self> {
        config.validate()?;

        let codec = MessageCodec::new(config.encryption_key.as_deref());
        if !codec.is_encrypted() {
            warn!("Encryption disabled, messages are sent in plaintext");
        }

        let (outbound_tx, outbound_rx) = bounded(config.queue_size);
        let (acks_tx, acks_rx) = bounded(config.queue_size);
        let (inbox_tx, inbox_rx) = bounded(config.queue_size);

        Ok(Self {
            shared: Arc::new(EngineShared {
                ids: MessageIdGenerator::new(&config.node_id),
                deliveries: DeliveryLog::new(config.delivery_log_size),
                codec,
                radio: Mutex::new(radio),
                stats: Mutex::new(Statistics::default()),
                pending: PendingAcks::new(),
                handlers: RwLock::new(HashMap::new()),
                outbound_tx,
                outbound_rx,
                acks_tx,
                acks_rx,
                inbox_tx,
                inbox_rx,
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                config,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn with_transceiver<T: Transceiver + 'static>(config: ProtocolConfig, radio: T) -> ProtocolResult<Self> {
        Self::new(config, Box::new(radio))
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }

    pub fn node_id(&self) -> &str {
        &self.shared.config.node_id
    }

    /// Initialise and configure the radio. Not retried; the caller decides.
    pub fn connect(&self, bus: &BusConfig, radio: &RadioConfig) -> ProtocolResult<()> {
        {
            let mut transceiver = self.shared.radio.lock();
            transceiver.begin(bus)?;
            transceiver.configure(radio)?;
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        info!(
            node_id = %self.shared.config.node_id,
            frequency_hz = radio.frequency_hz,
            spreading_factor = radio.spreading_factor,
            tx_power_dbm = radio.tx_power_dbm,
            "LoRa radio connected"
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawn the receive and send workers
    pub fn start(&self) -> ProtocolResult<()> {
        if !self.shared.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProtocolError::AlreadyRunning);
        }
        if let Err(e) = self.shared.radio.lock().wake() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        for (name, work) in [
            ("lora-rx", rx_loop as fn(&EngineShared)),
            ("lora-tx", tx_loop as fn(&EngineShared)),
        ] {
            match spawn_worker(&self.shared, name, work) {
                Ok(worker) => self.workers.lock().push(worker),
                Err(e) => {
                    error!(worker = name, error = %e, "Failed to spawn worker");
                    let _ = self.stop();
                    return Err(ProtocolError::NotStarted);
                }
            }
        }

        info!(node_id = %self.shared.config.node_id, "LoRa protocol started");
        Ok(())
    }

    /// Stop both workers, waiting at most the shutdown grace period for each,
    /// then put the radio to sleep
    pub fn stop(&self) -> ProtocolResult<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        let grace = self.shared.config.shutdown_grace();
        let mut result = Ok(());

        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for worker in workers {
            match worker.done.recv_timeout(grace) {
                Ok(()) => {
                    let _ = worker.handle.join();
                }
                Err(_) => {
                    error!(worker = worker.name, ?grace, "Worker did not stop in time");
                    if result.is_ok() {
                        result = Err(ProtocolError::ShutdownTimeout {
                            worker: worker.name.to_string(),
                        });
                    }
                }
            }
        }

        if self.shared.is_connected() {
            if let Err(e) = self.shared.radio.lock().sleep() {
                warn!(error = %e, "Failed to put radio to sleep");
            }
        }
        info!("LoRa protocol stopped");
        result
    }

    /// Stop the workers and mark the radio unusable until the next `connect`
    pub fn disconnect(&self) -> ProtocolResult<()> {
        let result = self.stop();
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("LoRa radio disconnected");
        result
    }

    /// Queue a message for transmission, returning its id
    ///
    /// Never blocks: fails with `QueueFull` when the send queue is at capacity
    /// and with `NotConnected` before a successful `connect`.
    pub fn send(&self, payload: Payload, dst: Option<&str>, ack_req: bool) -> ProtocolResult<String> {
        self.shared.enqueue(payload, dst, ack_req)
    }

    pub fn send_minimal(&self, lat: f64, lon: f64, timestamp: u32) -> ProtocolResult<String> {
        self.shared
            .enqueue_minimal(MinimalPacket::new(lat, lon, timestamp))
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender {
            shared: Arc::downgrade(&self.shared),
            node_id: self.shared.config.node_id.clone(),
        }
    }

    /// Install the handler for `kind`, replacing any previous one
    pub fn register_handler<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let previous = self.shared.handlers.write().insert(kind, Arc::new(handler));
        if previous.is_some() {
            debug!(%kind, "Replaced message handler");
        }
    }

    pub fn unregister_handler(&self, kind: MessageType) {
        self.shared.handlers.write().remove(&kind);
    }

    /// Next inbound message of a type without a handler, waiting up to `timeout`
    pub fn poll_message(&self, timeout: Duration) -> Option<Message> {
        self.poll_received(timeout).map(|received| received.message)
    }

    /// Like `poll_message`, keeping the RSSI and SNR measured for that packet
    pub fn poll_received(&self, timeout: Duration) -> Option<ReceivedMessage> {
        self.shared.inbox_rx.recv_timeout(timeout).ok()
    }

    pub fn statistics(&self) -> Statistics {
        self.shared.stats.lock().clone()
    }

    pub fn delivery_state(&self, message_id: &str) -> Option<DeliveryState> {
        self.shared.deliveries.get(message_id)
    }

    /// Block until `message_id` is delivered or fails, or `timeout` passes
    pub fn wait_for_delivery(&self, message_id: &str, timeout: Duration) -> Option<DeliveryState> {
        self.shared.deliveries.wait_for(message_id, timeout)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.outbound_rx.len()
    }

    pub fn radio_status(&self) -> TransceiverStatus {
        self.shared.radio.lock().status()
    }
}

impl Drop for LoRaEngine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

fn spawn_worker(
    shared: &Arc<EngineShared>,
    name: &'static str,
    work: fn(&EngineShared),
) -> std::io::Result<Worker> {
    let shared = Arc::clone(shared);
    let (done_tx, done_rx) = bounded(1);
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        info!(worker = name, "Worker started");
        work(&shared);
        info!(worker = name, "Worker stopped");
        let _ = done_tx.send(());
    })?;
    Ok(Worker {
        name,
        done: done_rx,
        handle,
    })
}

fn rx_loop(shared: &EngineShared) {
    let poll_interval = shared.config.rx_poll_interval();
    while shared.is_running() {
        let received = {
            let mut radio = shared.radio.lock();
            radio
                .receive_poll()
                .map(|bytes| (bytes, radio.last_rssi_dbm(), radio.last_snr_db()))
        };

        match received {
            Some((bytes, rssi, snr)) => {
                if let Err(e) = handle_packet(shared, &bytes, rssi, snr) {
                    shared.stats.lock().rx_errors += 1;
                    warn!(error = %e, len = bytes.len(), "Dropping undecodable packet");
                }
            }
            None => thread::sleep(poll_interval),
        }
    }
}

fn handle_packet(shared: &EngineShared, bytes: &[u8], rssi: f64, snr: f64) -> ProtocolResult<()> {
    let frame = shared.codec.decode_frame(bytes)?;
    shared.stats.lock().record_rx(bytes.len(), rssi, snr);

    let message = match frame {
        Frame::Message(message) => message,
        Frame::Minimal(packet) => Message::from_minimal(&packet),
    };

    let node_id = shared.config.node_id.as_str();
    if !message.is_addressed_to(node_id) {
        debug!(message_id = %message.id, dst = %message.dst, "Ignoring message for another node");
        return Ok(());
    }

    debug!(
        message_id = %message.id,
        kind = %message.message_type(),
        src = %message.src,
        rssi,
        snr,
        "Message received"
    );

    if let Payload::Ack { ack_id } = &message.payload {
        shared.stats.lock().acks_received += 1;
        if !shared.pending.resolve(ack_id) {
            debug!(%ack_id, "ACK for unknown or finished message");
        }
        return Ok(());
    }

    if message.ack_req {
        let ack = Message::ack_for(&message, shared.ids.next_ack_id(), node_id);
        if shared.acks_tx.try_send(ack).is_err() {
            warn!(message_id = %message.id, "ACK queue full, acknowledgment dropped");
        }
    }

    if dispatch(shared, &message) {
        return Ok(());
    }
    if let Err(e) = shared.inbox_tx.try_send(ReceivedMessage { message, rssi, snr }) {
        shared.stats.lock().rx_dropped += 1;
        warn!(message_id = %e.into_inner().message.id, "Receive queue full, dropping message");
    }
    Ok(())
}

/// Hand `message` to its handler thread; false when no handler is registered
fn dispatch(shared: &EngineShared, message: &Message) -> bool {
    let kind = message.message_type();
    let Some(handler) = shared.handlers.read().get(&kind).cloned() else {
        return false;
    };

    let message = message.clone();
    let spawned = thread::Builder::new()
        .name(format!("{}-handler", kind))
        .spawn(move || handler(message));
    if let Err(e) = spawned {
        error!(%kind, error = %e, "Failed to spawn message handler");
    }
    true
}

fn tx_loop(shared: &EngineShared) {
    while shared.is_running() {
        let next = match shared.acks_rx.try_recv() {
            Ok(ack) => Some(Outbound::Message(ack)),
            Err(_) => select! {
                recv(shared.acks_rx) -> ack => ack.ok().map(Outbound::Message),
                recv(shared.outbound_rx) -> outbound => outbound.ok(),
                default(WAIT_SLICE) => None,
            },
        };
        let Some(outbound) = next else {
            continue;
        };

        if let Err(e) = deliver(shared, outbound) {
            if e.is_recoverable() {
                warn!(error = %e, "Delivery failed");
            } else {
                error!(error = %e, "Delivery failed");
                shared.pause(shared.config.error_backoff());
            }
        }
        shared.pause(shared.config.tx_interval());
    }
}

fn deliver(shared: &EngineShared, outbound: Outbound) -> ProtocolResult<()> {
    match outbound {
        Outbound::Message(message) => deliver_message(shared, &message),
        Outbound::Minimal { id, packet } => {
            let bytes = packet.to_bytes();
            shared.deliveries.set(&id, DeliveryState::Transmitting);
            match shared.transmit(&bytes) {
                Ok(()) => {
                    shared.record_delivered();
                    shared.deliveries.set(&id, DeliveryState::Sent);
                    debug!(message_id = %id, "Minimal packet sent");
                    Ok(())
                }
                Err(e) => {
                    shared.record_failure(&id, DeliveryState::Failed);
                    Err(e)
                }
            }
        }
    }
}

fn deliver_message(shared: &EngineShared, message: &Message) -> ProtocolResult<()> {
    // Outbound ACKs are not tracked in the delivery log
    let tracked = !matches!(message.payload, Payload::Ack { .. });
    let id = message.id.as_str();

    let bytes = match shared.codec.encode(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            shared.stats.lock().tx_errors += 1;
            if tracked {
                shared.deliveries.set(id, DeliveryState::Failed);
            }
            return Err(e);
        }
    };

    if !message.ack_req {
        if tracked {
            shared.deliveries.set(id, DeliveryState::Transmitting);
        }
        return match shared.transmit(&bytes) {
            Ok(()) => {
                shared.record_delivered();
                if tracked {
                    shared.deliveries.set(id, DeliveryState::Sent);
                }
                debug!(message_id = %id, kind = %message.message_type(), len = bytes.len(), "Message sent");
                Ok(())
            }
            Err(e) => {
                shared.stats.lock().tx_errors += 1;
                if tracked {
                    shared.deliveries.set(id, DeliveryState::Failed);
                }
                Err(e)
            }
        };
    }

    let ack_signal = shared.pending.register(id);
    let result = transmit_until_acked(shared, id, &bytes, &ack_signal);
    shared.pending.discard(id);
    result
}

/// Transmit, wait for the ACK, back off and retransmit up to `max_retries`
fn transmit_until_acked(
    shared: &EngineShared,
    id: &str,
    bytes: &[u8],
    ack_signal: &Receiver<()>,
) -> ProtocolResult<()> {
    let config = &shared.config;
    let mut retry = 0u32;

    loop {
        let state = if retry == 0 {
            DeliveryState::Transmitting
        } else {
            DeliveryState::Retrying
        };
        shared.deliveries.set(id, state);

        match shared.transmit(bytes) {
            Ok(()) => {
                shared.deliveries.set(id, DeliveryState::AckPending);
                match wait_for_ack(shared, ack_signal, config.ack_timeout()) {
                    AckWait::Acked => {
                        shared.record_delivered();
                        shared.deliveries.set(id, DeliveryState::Acked);
                        debug!(message_id = %id, attempts = retry + 1, "Message acknowledged");
                        return Ok(());
                    }
                    AckWait::Stopped => {
                        shared.record_failure(id, DeliveryState::Failed);
                        return Err(ProtocolError::AckTimeout {
                            message_id: id.to_string(),
                            timeout: config.ack_timeout(),
                        });
                    }
                    AckWait::TimedOut => {
                        warn!(message_id = %id, attempt = retry + 1, "No ACK received");
                    }
                }
            }
            Err(e) if skips_retry(&e) => {
                shared.record_failure(id, DeliveryState::Failed);
                warn!(message_id = %id, error = %e, "Frame rejected by radio, not retrying");
                return Err(e);
            }
            Err(e) if e.is_recoverable() && retry < config.max_retries => {
                warn!(message_id = %id, attempt = retry + 1, error = %e, "Transmit failed");
            }
            Err(e) => {
                shared.record_failure(id, DeliveryState::Failed);
                return Err(e);
            }
        }

        if retry >= config.max_retries {
            shared.record_failure(id, DeliveryState::Exhausted);
            warn!(message_id = %id, attempts = retry + 1, "Delivery failed, retries exhausted");
            return Err(ProtocolError::Exhausted {
                message_id: id.to_string(),
                attempts: retry + 1,
            });
        }

        retry += 1;
        shared.stats.lock().retries += 1;
        let backoff = config
            .retry_base_delay()
            .saturating_mul(2u32.saturating_pow(retry));
        if !shared.pause(backoff) {
            shared.record_failure(id, DeliveryState::Failed);
            return Err(ProtocolError::AckTimeout {
                message_id: id.to_string(),
                timeout: config.ack_timeout(),
            });
        }
    }
}

/// Errors tied to the frame itself; retransmitting the same bytes cannot help
fn skips_retry(error: &ProtocolError) -> bool {
    matches!(error, ProtocolError::Hardware(e) if e.recovery_strategy() == RecoveryStrategy::Skip)
}

fn wait_for_ack(shared: &EngineShared, signal: &Receiver<()>, timeout: Duration) -> AckWait {
    let deadline = Instant::now() + timeout;
    loop {
        if !shared.is_running() {
            return AckWait::Stopped;
        }
        let now = Instant::now();
        if now >= deadline {
            return match signal.try_recv() {
                Ok(()) => AckWait::Acked,
                Err(_) => AckWait::TimedOut,
            };
        }

        select! {
            recv(signal) -> result => {
                return match result {
                    Ok(()) => AckWait::Acked,
                    Err(_) => AckWait::TimedOut,
                };
            },
            recv(shared.acks_rx) -> ack => {
                if let Ok(ack) = ack {
                    if let Err(e) = deliver_message(shared, &ack) {
                        warn!(error = %e, "Failed to send ACK");
                    }
                }
            },
            default(WAIT_SLICE.min(deadline - now)) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockTransceiver, LORA_MAX_PAYLOAD};
    use crate::protocol::message::{Heartbeat, PositionReport};
    use crate::protocol::packet::encode_minimal;

    fn test_config(node_id: &str) -> ProtocolConfig {
        ProtocolConfig {
            node_id: node_id.to_string(),
            destination_id: "TRACKER01".to_string(),
            tx_interval_ms: 2,
            ack_timeout_ms: 60,
            max_retries: 2,
            retry_base_delay_ms: 2,
            error_backoff_ms: 10,
            shutdown_grace_ms: 1000,
            ..Default::default()
        }
    }

    fn connected(config: ProtocolConfig, radio: MockTransceiver) -> LoRaEngine {
        let engine = LoRaEngine::with_transceiver(config, radio).unwrap();
        engine
            .connect(&BusConfig::default(), &RadioConfig::default())
            .unwrap();
        engine
    }

    fn heartbeat() -> Payload {
        Payload::Heartbeat(Heartbeat {
            battery: Some(80.0),
            ..Default::default()
        })
    }

    #[test]
    fn test_send_requires_connection() {
        let engine = LoRaEngine::with_transceiver(test_config("BEACON01"), MockTransceiver::new()).unwrap();
        assert!(matches!(
            engine.send(heartbeat(), None, false),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_start_requires_connection() {
        let engine =
            LoRaEngine::with_transceiver(test_config("BEACON01"), MockTransceiver::new()).unwrap();
        assert!(matches!(engine.start(), Err(ProtocolError::NotConnected)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProtocolConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            LoRaEngine::with_transceiver(config, MockTransceiver::new()),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let radio = MockTransceiver::new();
        radio.fail_begin(true);
        let engine = LoRaEngine::with_transceiver(test_config("BEACON01"), radio).unwrap();
        let result = engine.connect(&BusConfig::default(), &RadioConfig::default());
        assert!(matches!(result, Err(ProtocolError::Hardware(_))));
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_queue_full_fails_fast() {
        let config = ProtocolConfig {
            queue_size: 2,
            ..test_config("BEACON01")
        };
        let engine = connected(config, MockTransceiver::new());

        let first = engine.send(heartbeat(), None, false).unwrap();
        engine.send(heartbeat(), None, false).unwrap();
        assert!(matches!(
            engine.send(heartbeat(), None, false),
            Err(ProtocolError::QueueFull { capacity: 2 })
        ));
        assert_eq!(engine.queued_count(), 2);
        assert_eq!(engine.delivery_state(&first), Some(DeliveryState::Queued));
    }

    #[test]
    fn test_message_without_ack_is_sent() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("BEACON01"), radio.clone());
        engine.start().unwrap();

        let id = engine.send(heartbeat(), None, false).unwrap();
        assert_eq!(
            engine.wait_for_delivery(&id, Duration::from_secs(2)),
            Some(DeliveryState::Sent)
        );
        assert_eq!(radio.sent_packets().len(), 1);
        assert_eq!(engine.statistics().tx_packets, 1);
        engine.stop().unwrap();
    }

    #[test]
    fn test_missing_ack_exhausts_once() {
        let radio = MockTransceiver::new();
        radio.drop_outgoing(true);
        let engine = connected(test_config("BEACON01"), radio.clone());
        engine.start().unwrap();

        let id = engine.send(heartbeat(), None, true).unwrap();
        assert_eq!(
            engine.wait_for_delivery(&id, Duration::from_secs(3)),
            Some(DeliveryState::Exhausted)
        );

        let stats = engine.statistics();
        assert_eq!(stats.tx_errors, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.tx_packets, 0);
        let sent = radio.sent_packets();
        assert_eq!(sent.len(), 3);
        // Every attempt went on air, so every attempt counts
        assert_eq!(stats.tx_bytes, sent.iter().map(Vec::len).sum::<usize>() as u64);
        engine.stop().unwrap();
    }

    #[test]
    fn test_ack_after_retransmission() {
        let radio = MockTransceiver::new();
        let config = ProtocolConfig {
            ack_timeout_ms: 300,
            ..test_config("BEACON01")
        };
        let engine = connected(config, radio.clone());
        engine.start().unwrap();

        let id = engine.send(heartbeat(), None, true).unwrap();

        // Let the first attempt go unanswered, acknowledge the second
        let deadline = Instant::now() + Duration::from_secs(3);
        while radio.sent_packets().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        let codec = MessageCodec::new(Some("0123456789ABCDEF"));
        let retransmitted = codec.decode(&radio.sent_packets()[1]).unwrap();
        assert_eq!(retransmitted.id, id);
        let ack = Message::ack_for(&retransmitted, "ack_TRACKER01_1_1".to_string(), "TRACKER01");
        radio.inject(codec.encode(&ack).unwrap());

        assert_eq!(
            engine.wait_for_delivery(&id, Duration::from_secs(2)),
            Some(DeliveryState::Acked)
        );
        let stats = engine.statistics();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_errors, 0);
        assert_eq!(stats.acks_received, 1);
        let sent = radio.sent_packets();
        assert_eq!(sent.len(), 2);
        assert_eq!(stats.tx_bytes, sent.iter().map(Vec::len).sum::<usize>() as u64);
        engine.stop().unwrap();
    }

    #[test]
    fn test_oversized_frame_fails_without_retry() {
        let radio = MockTransceiver::new();
        radio.set_max_payload(Some(LORA_MAX_PAYLOAD));
        let engine = connected(test_config("BEACON01"), radio.clone());
        engine.start().unwrap();

        let mut extra = serde_json::Map::new();
        extra.insert("note".to_string(), serde_json::Value::String("x".repeat(300)));
        let payload = Payload::Heartbeat(Heartbeat {
            extra,
            ..Default::default()
        });
        let id = engine.send(payload, None, true).unwrap();
        assert_eq!(
            engine.wait_for_delivery(&id, Duration::from_secs(2)),
            Some(DeliveryState::Failed)
        );

        let stats = engine.statistics();
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.tx_errors, 1);
        assert_eq!(stats.tx_bytes, 0);
        assert!(radio.sent_packets().is_empty());
        engine.stop().unwrap();
    }

    #[test]
    fn test_transmissions_respect_interval() {
        let radio = MockTransceiver::new();
        let config = ProtocolConfig {
            tx_interval_ms: 300,
            ..test_config("BEACON01")
        };
        let engine = connected(config, radio.clone());
        engine.start().unwrap();

        let first = engine.send(heartbeat(), None, false).unwrap();
        let second = engine.send(heartbeat(), None, false).unwrap();

        assert_eq!(
            engine.wait_for_delivery(&first, Duration::from_secs(2)),
            Some(DeliveryState::Sent)
        );
        let first_sent = Instant::now();
        assert_eq!(engine.delivery_state(&second), Some(DeliveryState::Queued));
        assert_eq!(
            engine.wait_for_delivery(&second, Duration::from_secs(2)),
            Some(DeliveryState::Sent)
        );
        let gap = first_sent.elapsed();
        assert!(gap >= Duration::from_millis(250), "second frame after {:?}", gap);
        assert_eq!(radio.sent_packets().len(), 2);
        engine.stop().unwrap();
    }

    #[test]
    fn test_minimal_ids_are_unique() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("BEACON01"), radio.clone());
        engine.start().unwrap();

        let first = engine.send_minimal(51.5, -0.12, 1_700_000_000).unwrap();
        let second = engine.send_minimal(51.5, -0.12, 1_700_000_000).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("minimal_BEACON01_"));

        for id in [&first, &second] {
            assert_eq!(
                engine.wait_for_delivery(id, Duration::from_secs(2)),
                Some(DeliveryState::Sent)
            );
        }
        let stats = engine.statistics();
        assert_eq!(stats.tx_packets, 2);
        assert_eq!(stats.tx_bytes, 2 * crate::protocol::packet::MINIMAL_PACKET_LEN as u64);
        engine.stop().unwrap();
    }

    #[test]
    fn test_received_message_keeps_its_link_quality() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("TRACKER01"), radio.clone());
        engine.start().unwrap();

        let codec = MessageCodec::new(Some("0123456789ABCDEF"));
        radio.set_signal(-101.0, -7.5);
        let first = Message::new("BEACON01_1_1".to_string(), "BEACON01", "TRACKER01", heartbeat(), false);
        radio.inject(codec.encode(&first).unwrap());

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.statistics().rx_packets < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        radio.set_signal(-45.0, 11.0);
        let second = Message::new("BEACON01_1_2".to_string(), "BEACON01", "TRACKER01", heartbeat(), false);
        radio.inject(codec.encode(&second).unwrap());
        while engine.statistics().rx_packets < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        let received = engine.poll_received(Duration::from_secs(2)).unwrap();
        assert_eq!(received.message.id, first.id);
        assert_eq!(received.rssi, -101.0);
        assert_eq!(received.snr, -7.5);

        let received = engine.poll_received(Duration::from_secs(2)).unwrap();
        assert_eq!(received.message.id, second.id);
        assert_eq!(received.rssi, -45.0);
        assert_eq!(received.snr, 11.0);
        engine.stop().unwrap();
    }

    #[test]
    fn test_transmit_error_marks_failed() {
        let radio = MockTransceiver::new();
        radio.fail_transmit(true);
        let engine = connected(test_config("BEACON01"), radio);
        engine.start().unwrap();

        let id = engine.send(heartbeat(), None, false).unwrap();
        assert_eq!(
            engine.wait_for_delivery(&id, Duration::from_secs(2)),
            Some(DeliveryState::Failed)
        );
        assert_eq!(engine.statistics().tx_errors, 1);
        engine.stop().unwrap();
    }

    #[test]
    fn test_inbound_message_is_acked_and_queued() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("TRACKER01"), radio.clone());
        engine.start().unwrap();

        let codec = MessageCodec::new(Some("0123456789ABCDEF"));
        let inbound = Message::new(
            "BEACON01_1700000000_1".to_string(),
            "BEACON01",
            "TRACKER01",
            Payload::Position(PositionReport {
                lat: 51.5,
                lon: -0.12,
                ..Default::default()
            }),
            true,
        );
        radio.inject(codec.encode(&inbound).unwrap());

        let received = engine.poll_message(Duration::from_secs(2)).unwrap();
        assert_eq!(received, inbound);

        // The ACK goes back to the sender
        let deadline = Instant::now() + Duration::from_secs(2);
        while radio.sent_packets().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let sent = radio.sent_packets();
        assert_eq!(sent.len(), 1);
        let ack = codec.decode(&sent[0]).unwrap();
        assert_eq!(ack.dst, "BEACON01");
        assert_eq!(ack.payload, Payload::Ack { ack_id: inbound.id.clone() });
        assert!(!ack.ack_req);

        let stats = engine.statistics();
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.rssi, -60.0);
        assert_eq!(stats.tx_bytes, sent[0].len() as u64);
        assert_eq!(stats.tx_packets, 1);
        engine.stop().unwrap();
    }

    #[test]
    fn test_message_for_other_node_is_dropped() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("TRACKER01"), radio.clone());
        engine.start().unwrap();

        let codec = MessageCodec::new(Some("0123456789ABCDEF"));
        let inbound = Message::new("X_1_1".to_string(), "X", "OTHER", heartbeat(), true);
        radio.inject(codec.encode(&inbound).unwrap());

        assert!(engine.poll_message(Duration::from_millis(200)).is_none());
        assert!(radio.sent_packets().is_empty());
        assert_eq!(engine.statistics().rx_packets, 1);
        engine.stop().unwrap();
    }

    #[test]
    fn test_minimal_and_garbage_frames() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("TRACKER01"), radio.clone());
        engine.start().unwrap();

        radio.inject(b"garbage".to_vec());
        radio.inject(encode_minimal(51.5074, -0.1278, 1_700_000_000).to_vec());

        let message = engine.poll_message(Duration::from_secs(2)).unwrap();
        assert_eq!(message.src, "unknown");
        match message.payload {
            Payload::Position(report) => assert!((report.lat - 51.5074).abs() < 1e-6),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(engine.statistics().rx_errors, 1);
        engine.stop().unwrap();
    }

    #[test]
    fn test_handler_dispatch() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("TRACKER01"), radio.clone());
        let (tx, rx) = bounded(4);
        engine.register_handler(MessageType::Heartbeat, move |message| {
            let _ = tx.send(message.id);
        });
        engine.start().unwrap();

        let codec = MessageCodec::new(Some("0123456789ABCDEF"));
        let inbound = Message::new("B_1_7".to_string(), "B", "broadcast", heartbeat(), false);
        radio.inject(codec.encode(&inbound).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "B_1_7");
        // Handled types bypass the poll queue
        assert!(engine.poll_message(Duration::from_millis(50)).is_none());
        engine.stop().unwrap();
    }

    #[test]
    fn test_stop_sleeps_radio() {
        let radio = MockTransceiver::new();
        let engine = connected(test_config("BEACON01"), radio.clone());
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(ProtocolError::AlreadyRunning)));

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(radio.status().sleeping);

        engine.disconnect().unwrap();
        assert!(!engine.is_connected());
        assert!(matches!(
            engine.send(heartbeat(), None, false),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_sender_outlives_engine_safely() {
        let engine = connected(test_config("BEACON01"), MockTransceiver::new());
        let sender = engine.sender();
        assert_eq!(sender.node_id(), "BEACON01");
        assert!(sender.send(heartbeat(), None, false).is_ok());
        drop(engine);
        assert!(matches!(
            sender.send(heartbeat(), None, false),
            Err(ProtocolError::NotConnected)
        ));
    }
}
