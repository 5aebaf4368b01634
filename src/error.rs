//! Error types for the relay client
//!
//! Errors fall into four groups that drive different behavior upstream:
//!
//! | Group | Variants | Retried | Breaker |
//! |-------|----------|---------|---------|
//! | Validation | `InvalidAddress`, `Validation`, `Encode` | no | not reported |
//! | Transport | `Connection`, `Timeout`, `Io`, gateway exceptions | yes | failure |
//! | Protocol | `Protocol(ProtocolError)` | yes | failure |
//! | Fast-fail | `CircuitOpen` | no | not reported |
//!
//! A device exception other than the gateway ones (0x0A, 0x0B) means the
//! gateway and slave answered; it is surfaced as-is and never retried.

use thiserror::Error;

use crate::constants::{EXCEPTION_GATEWAY_PATH_UNAVAILABLE, EXCEPTION_GATEWAY_TARGET_FAILED};

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Frame-level decode failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than the frame header announces
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// More bytes than the frame header announces
    #[error("Frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// CRC trailer does not match the frame body
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Response answers a different function than the one requested
    #[error("Unexpected function code: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedFunctionCode { expected: u8, actual: u8 },

    /// Response comes from a different device address
    #[error("Unexpected device address: expected {expected}, got {actual}")]
    UnexpectedDevice { expected: u8, actual: u8 },

    /// Function code outside the coil subset this crate speaks
    #[error("Unsupported function code 0x{function:02X}")]
    UnsupportedFunction { function: u8 },

    /// Write response does not echo the request
    #[error("Write echo mismatch: {message}")]
    EchoMismatch { message: String },

    /// Well-framed but semantically invalid payload
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },
}

/// Relay client errors
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// Relay address outside `1..=max`
    #[error("Invalid relay address {address}: must be between 1 and {max}")]
    InvalidAddress { address: u16, max: u16 },

    /// Configuration or argument validation failure
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Command cannot be represented on the wire
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Connection could not be established or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its deadline
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Read/write failure on an established stream
    #[error("IO error: {message}")]
    Io { message: String },

    /// Malformed or mismatched response frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Device answered with a Modbus exception
    #[error("Device exception for function 0x{function:02X}: code 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    /// Circuit breaker is open; the call was not attempted
    #[error("Circuit open: next trial call allowed in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io {
            message: err.to_string(),
        }
    }
}

impl RelayError {
    pub fn invalid_address(address: u16, max: u16) -> Self {
        RelayError::InvalidAddress { address, max }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        RelayError::Encode {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        RelayError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        RelayError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        RelayError::Io {
            message: message.into(),
        }
    }

    /// Connect, timeout, IO and gateway-level failures
    pub fn is_transport(&self) -> bool {
        match self {
            RelayError::Connection { .. } | RelayError::Timeout { .. } | RelayError::Io { .. } => {
                true
            },
            RelayError::Exception { code, .. } => is_gateway_exception(*code),
            _ => false,
        }
    }

    /// Whether another attempt on a fresh connection may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, RelayError::Protocol(_))
    }

    /// Whether this error is a failure outcome for the circuit breaker
    pub fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }

    /// Caller-side mistakes that never reach the wire
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidAddress { .. }
                | RelayError::Validation { .. }
                | RelayError::Encode { .. }
        )
    }
}

fn is_gateway_exception(code: u8) -> bool {
    code == EXCEPTION_GATEWAY_PATH_UNAVAILABLE || code == EXCEPTION_GATEWAY_TARGET_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(RelayError::connection("refused").is_retryable());
        assert!(RelayError::timeout("read response", 500).is_retryable());
        assert!(RelayError::io("reset by peer").is_retryable());
        assert!(RelayError::from(ProtocolError::ChecksumMismatch {
            expected: 1,
            actual: 2
        })
        .is_retryable());
    }

    #[test]
    fn test_validation_errors_are_terminal() {
        let err = RelayError::invalid_address(9, 8);
        assert!(!err.is_retryable());
        assert!(!err.counts_against_breaker());
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Invalid relay address 9: must be between 1 and 8"
        );
        assert!(!RelayError::CircuitOpen { retry_in_ms: 10 }.is_retryable());
    }

    #[test]
    fn test_exception_classification() {
        let illegal = RelayError::Exception {
            function: 0x05,
            code: 0x02,
        };
        assert!(!illegal.is_retryable());
        assert!(!illegal.is_transport());

        let gateway = RelayError::Exception {
            function: 0x01,
            code: EXCEPTION_GATEWAY_TARGET_FAILED,
        };
        assert!(gateway.is_transport());
        assert!(gateway.counts_against_breaker());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io { .. }));
    }
}
