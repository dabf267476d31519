//! Radio hardware error types and recovery classification

use thiserror::Error;

/// Errors raised by a radio transceiver
#[derive(Debug, Error)]
pub enum HardwareError {
    /// Bus or chip initialisation failed
    #[error("Transceiver initialisation failed: {reason}")]
    InitFailed { reason: String },
    /// A radio or bus parameter was rejected
    #[error("Configuration error: invalid {parameter} = {value}")]
    ConfigurationError { parameter: String, value: String },
    /// Operation attempted before `begin` succeeded or after the link dropped
    #[error("Transceiver not connected")]
    NotConnected,
    /// The chip did not complete the transmission
    #[error("Transmit failed: {reason}")]
    TransmitFailed { reason: String },
    /// Payload exceeds the radio FIFO
    #[error("Payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transceiver operations
pub type HardwareResult<T> = Result<T, HardwareError>;

/// Recommended reaction to a hardware failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryStrategy {
    /// Retry the operation after a short delay
    RetryWithDelay { delay_ms: u32 },
    /// Drop the current payload and continue
    Skip,
    /// Tear down and reconnect before further use
    Reconnect,
    /// Fail permanently
    Fail,
}

impl HardwareError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            HardwareError::InitFailed { .. } => RecoveryStrategy::Fail,
            HardwareError::ConfigurationError { .. } => RecoveryStrategy::Fail,
            HardwareError::NotConnected => RecoveryStrategy::Reconnect,
            HardwareError::TransmitFailed { .. } => RecoveryStrategy::RetryWithDelay { delay_ms: 100 },
            HardwareError::PayloadTooLarge { .. } => RecoveryStrategy::Skip,
            HardwareError::Io(_) => RecoveryStrategy::RetryWithDelay { delay_ms: 1000 },
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.recovery_strategy(),
            RecoveryStrategy::Fail | RecoveryStrategy::Reconnect
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification() {
        assert!(HardwareError::TransmitFailed { reason: "busy".into() }.is_recoverable());
        assert!(HardwareError::PayloadTooLarge { size: 300, max: 255 }.is_recoverable());
        assert!(!HardwareError::NotConnected.is_recoverable());
        assert!(!HardwareError::InitFailed { reason: "no chip".into() }.is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = HardwareError::ConfigurationError {
            parameter: "spreading_factor".into(),
            value: "13".into(),
        };
        assert_eq!(err.to_string(), "Configuration error: invalid spreading_factor = 13");
    }
}
