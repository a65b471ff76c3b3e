//! Driver error types

use common::Direction;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::session::{LifecycleState, SessionId};

/// Final status of a USB transfer, as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    /// Transfer completed; the buffer holds the transferred bytes
    Completed,
    /// Transfer was cancelled before it completed
    Cancelled,
    /// Endpoint halted
    Stall,
    /// Transfer timed out
    Timeout,
    /// Device is gone
    NoDevice,
    /// Device sent more data than the buffer holds
    Overflow,
    /// Generic I/O failure
    Io,
    /// Anything the transport could not map
    Other(String),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => f.write_str("completed"),
            TransferStatus::Cancelled => f.write_str("cancelled"),
            TransferStatus::Stall => f.write_str("endpoint stalled"),
            TransferStatus::Timeout => f.write_str("timed out"),
            TransferStatus::NoDevice => f.write_str("no device"),
            TransferStatus::Overflow => f.write_str("overflow"),
            TransferStatus::Io => f.write_str("I/O error"),
            TransferStatus::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Errors produced by the bridge core
#[derive(Debug, Error)]
pub enum DriverError {
    /// Classification found no usable endpoint in the given direction
    #[error("Required {direction} endpoint missing")]
    MissingEndpoint { direction: Direction },

    /// The network interface could not be allocated or registered
    #[error("Network interface registration failed: {0}")]
    RegistrationFailed(String),

    /// The frame pool is exhausted
    #[error("Buffer allocation failed: requested {requested} bytes, {available} available")]
    AllocationFailed { requested: usize, available: usize },

    /// Submission or completion reported a transport-level error
    #[error("Transfer failed: {0}")]
    TransferFailed(TransferStatus),

    /// Operation attempted outside its required lifecycle state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Malformed frame or transfer payload
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::MissingEndpoint {
            direction: Direction::In,
        };
        assert_eq!(err.to_string(), "Required bulk-in endpoint missing");

        let err = DriverError::InvalidState {
            operation: "transmit",
            state: LifecycleState::Detaching,
        };
        assert_eq!(err.to_string(), "Cannot transmit while session is detaching");
    }

    #[test]
    fn test_transfer_status_success() {
        assert!(TransferStatus::Completed.is_success());
        assert!(!TransferStatus::Cancelled.is_success());
        assert!(!TransferStatus::Other("babble".into()).is_success());
        assert_eq!(
            DriverError::TransferFailed(TransferStatus::Stall).to_string(),
            "Transfer failed: endpoint stalled"
        );
    }
}
