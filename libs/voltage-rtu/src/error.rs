//! Error types for the RTU master
//!
//! Three layers report failures: the frame codec ([`DecodeError`]), the serial
//! transport ([`TransportError`]) and everything above them ([`RtuError`]).
//! Codec and transport errors are folded into [`RtuError`] so callers of a hub
//! only ever match on one type.

use thiserror::Error;

/// Result type for voltage-rtu operations
pub type Result<T> = std::result::Result<T, RtuError>;

/// Failures of a single write-then-read cycle on the serial line
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Some bytes arrived but the frame was not complete before the deadline
    #[error("Timeout: received {received} of {expected} bytes")]
    Timeout { received: usize, expected: usize },

    /// Nothing arrived before the deadline
    #[error("No response")]
    NoResponse,

    /// The serial device could not be opened or configured
    #[error("Failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    /// Read/write failure on an open device
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Response frame validation failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame too short, wrong length, or unexpected slave/function
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC over the frame does not match the trailing two bytes
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    /// The slave answered with a Modbus exception
    #[error("Exception 0x{code:02X} ({}) for function 0x{function:02X}", describe(.code))]
    Exception { function: u8, code: u8 },
}

/// Unified error type returned by masters, hubs and the registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtuError {
    /// Invalid or duplicate hub definition
    #[error("Configuration error: {0}")]
    Config(String),

    /// Out-of-range address, count or value; nothing was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serial I/O failure or silence
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed response bytes
    #[error("Framing error: {0}")]
    Framing(String),

    /// Corrupted response bytes
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    /// Modbus exception reported by the slave, code kept intact
    #[error("Slave exception 0x{code:02X} ({}) for function 0x{function:02X}", describe(.code))]
    Exception { function: u8, code: u8 },

    /// Hub used before `connect()`
    #[error("Hub not connected: {0}")]
    NotConnected(String),

    /// Hub used after `close()`
    #[error("Hub closed: {0}")]
    Closed(String),

    /// No hub registered under this name
    #[error("Unknown hub: {0}")]
    UnknownHub(String),

    /// The exchange task died before reporting a result
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DecodeError> for RtuError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Framing(msg) => RtuError::Framing(msg),
            DecodeError::Checksum { expected, actual } => RtuError::Checksum { expected, actual },
            DecodeError::Exception { function, code } => RtuError::Exception { function, code },
        }
    }
}

impl RtuError {
    pub fn config(msg: impl Into<String>) -> Self {
        RtuError::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        RtuError::InvalidArgument(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        RtuError::Framing(msg.into())
    }

    /// True when the exchange on the wire failed (silence, I/O, bad bytes).
    ///
    /// Exceptions are not bus failures: the slave understood the request and
    /// answered deliberately.
    pub fn is_bus_failure(&self) -> bool {
        matches!(
            self,
            RtuError::Transport(_) | RtuError::Framing(_) | RtuError::Checksum { .. }
        )
    }

    /// Modbus exception code, if the slave reported one
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            RtuError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn describe(code: &u8) -> &'static str {
    exception_description(*code)
}

/// Human-readable name of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_conversion_keeps_exception_code() {
        let err: RtuError = DecodeError::Exception {
            function: 0x03,
            code: 0x02,
        }
        .into();
        assert_eq!(err.exception_code(), Some(0x02));
        assert!(!err.is_bus_failure());
        assert!(err.to_string().contains("Illegal Data Address"));
    }

    #[test]
    fn test_bus_failure_classification() {
        assert!(RtuError::from(TransportError::NoResponse).is_bus_failure());
        assert!(RtuError::framing("short").is_bus_failure());
        assert!(RtuError::Checksum {
            expected: 1,
            actual: 2
        }
        .is_bus_failure());
        assert!(!RtuError::invalid_argument("count").is_bus_failure());
        assert!(!RtuError::Closed("default".into()).is_bus_failure());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Timeout {
            received: 3,
            expected: 8,
        };
        assert_eq!(err.to_string(), "Timeout: received 3 of 8 bytes");
    }
}
