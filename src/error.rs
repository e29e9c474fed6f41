//! Driver Error Types
//!
//! Core error taxonomy for the device link engine.

use thiserror::Error;

use crate::frame::FunctionCode;

/// Result type for gsensor-link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Device link errors
#[derive(Debug, Error, Clone)]
pub enum LinkError {
    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Connect attempt exceeded its deadline
    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    /// No acknowledgement arrived within the command timeout
    #[error("Command timeout waiting for {expected} ack")]
    CommandTimeout { expected: FunctionCode },

    /// Acknowledgement carried an unexpected function code
    #[error("Command mismatch: expected {expected} ack, got {actual}")]
    CommandMismatch {
        expected: FunctionCode,
        actual: FunctionCode,
    },

    /// Telemetry payload length outside the closed layout set
    #[error("Invalid {function} payload length: {len}")]
    DecodeLength { function: FunctionCode, len: usize },

    /// Fatal socket-level failure
    #[error("Transport fault: {0}")]
    TransportFault(String),

    /// Byte pipe exhausted while the transport is faulted
    #[error("Upstream closed: byte pipe exhausted after transport fault")]
    UpstreamClosed,

    /// CSV persistence errors
    #[error("CSV error: {0}")]
    Csv(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<csv::Error> for LinkError {
    fn from(err: csv::Error) -> Self {
        LinkError::Csv(err.to_string())
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::Io(msg.into())
    }

    pub fn transport_fault(msg: impl Into<String>) -> Self {
        LinkError::TransportFault(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    /// Check if this error leaves the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::TransportFault(_) | LinkError::UpstreamClosed | LinkError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_are_not_fatal() {
        let err = LinkError::CommandTimeout {
            expected: FunctionCode::START,
        };
        assert!(!err.is_fatal());

        let err = LinkError::CommandMismatch {
            expected: FunctionCode::WRITE_REG_ACK,
            actual: FunctionCode::READ_REG_ACK,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(LinkError::transport_fault("reset by peer").is_fatal());
        assert!(LinkError::UpstreamClosed.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: LinkError = io.into();
        assert!(matches!(err, LinkError::Io(_)));
        assert!(err.to_string().contains("reset"));
    }
}
