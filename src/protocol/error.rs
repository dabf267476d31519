//! Protocol error types

use std::time::Duration;

use thiserror::Error;

use crate::hardware::HardwareError;
use crate::utils::config::ConfigError;

/// Errors raised by the codec and the protocol engine
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Ciphertext could not be decoded, decrypted or unpadded
    #[error("Decryption failed: {reason}")]
    DecryptionFailed { reason: String },
    /// Bytes are not a recognisable message
    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },
    #[error("Failed to encode message: {reason}")]
    EncodeFailed { reason: String },
    /// Send queue at capacity; the message was not queued
    #[error("Send queue full ({capacity} messages)")]
    QueueFull { capacity: usize },
    #[error("No acknowledgment for {message_id} within {timeout:?}")]
    AckTimeout { message_id: String, timeout: Duration },
    /// All transmit attempts used without an acknowledgment
    #[error("Delivery of {message_id} failed after {attempts} attempts")]
    Exhausted { message_id: String, attempts: u32 },
    #[error("Radio not connected")]
    NotConnected,
    #[error("Protocol engine not started")]
    NotStarted,
    #[error("Protocol engine already running")]
    AlreadyRunning,
    #[error("Worker {worker} did not stop within the shutdown grace period")]
    ShutdownTimeout { worker: String },
    #[error("Unknown message id {message_id}")]
    UnknownMessage { message_id: String },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    /// Recoverable errors affect a single message; the engine keeps running
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::DecryptionFailed { .. }
            | ProtocolError::MalformedPayload { .. }
            | ProtocolError::EncodeFailed { .. }
            | ProtocolError::QueueFull { .. }
            | ProtocolError::AckTimeout { .. }
            | ProtocolError::Exhausted { .. }
            | ProtocolError::UnknownMessage { .. } => true,
            ProtocolError::Hardware(e) => e.is_recoverable(),
            ProtocolError::NotConnected
            | ProtocolError::NotStarted
            | ProtocolError::AlreadyRunning
            | ProtocolError::ShutdownTimeout { .. }
            | ProtocolError::Config(_) => false,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedPayload {
            reason: err.to_string(),
        }
    }
}
