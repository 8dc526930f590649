//! Error types for the BPIO2 client.

use thiserror::Error;

use super::packet::MessageKind;
use super::session::{ModeKind, ModeState};

/// Result type alias for BPIO2 operations.
pub type BpioResult<T> = Result<T, BpioError>;

/// Failure classes callers and the retry policy reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No response within the deadline.
    TimedOut,
    /// The transport failed or is gone.
    Link,
    /// A frame arrived but its content is unusable or uncorrelated.
    Protocol,
    /// A bus operation was issued outside its mode.
    WrongMode,
    /// Flash read-back differs from what was written.
    Verification,
    /// The device answered with an error.
    Device,
    /// The caller passed something the client cannot act on.
    InvalidParameter,
}

/// Errors that can occur while talking to a BPIO2 device.
#[derive(Debug, Error)]
pub enum BpioError {
    /// Transport I/O failure.
    #[error("Link error during {operation}: {source}")]
    Link {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serial port could not be found.
    #[error("No device found at '{port}'")]
    NoDeviceFound { port: String },

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// The session was closed.
    #[error("Session closed; {operation} not performed")]
    Closed { operation: String },

    /// No complete response frame within the deadline.
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// COBS code byte pointed past the end of the frame.
    #[error("Invalid COBS frame: {reason}")]
    InvalidFrame { reason: String },

    /// Incoming frame grew past the limit without a delimiter.
    #[error("Frame size {size} exceeds maximum {max_size}")]
    FrameTooLarge { size: usize, max_size: usize },

    /// Message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// Message could not be deserialized.
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// A decoded response failed validation for the exchange in flight.
    #[error("Protocol error during {operation}: {reason}")]
    Protocol { operation: String, reason: String },

    /// Response type does not pair with the request type.
    #[error("Unexpected {actual:?} response to {operation}, expected {expected:?}")]
    UnexpectedResponse {
        operation: String,
        expected: MessageKind,
        actual: MessageKind,
    },

    /// Device returned fewer bytes than requested for a chunk.
    #[error("Short read at offset 0x{offset:06X}: requested {expected} bytes, got {actual}")]
    ShortRead {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Device returned more bytes than requested for a chunk.
    #[error("Long read at offset 0x{offset:06X}: requested {expected} bytes, got {actual}")]
    LongRead {
        offset: u32,
        expected: usize,
        actual: usize,
    },

    /// Bus operation issued while the session is not in the matching mode.
    #[error("{operation} requires {expected} mode, session is {actual}")]
    WrongMode {
        operation: String,
        expected: ModeKind,
        actual: ModeState,
    },

    /// Raw bus data sent while no bus mode is active.
    #[error("{operation} requires an active bus mode, session is idle")]
    NoActiveMode { operation: String },

    /// A mode transition is already underway.
    #[error("{operation} not allowed while session is {state}")]
    ModeBusy { operation: String, state: ModeState },

    /// Read-back after write did not match.
    #[error(
        "Verification failed at 0x{offset:06X} (chunk 0x{chunk_offset:06X}+{chunk_len}): \
         wrote 0x{expected:02X}, read 0x{actual:02X}"
    )]
    Verification {
        offset: u32,
        chunk_offset: u32,
        chunk_len: usize,
        expected: u8,
        actual: u8,
    },

    /// The device reported an error in its response.
    #[error("Device rejected {operation}: {message}")]
    Device { operation: String, message: String },

    /// Invalid argument or configuration.
    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// Settings file could not be loaded.
    #[error("Failed to load settings from {path}: {reason}")]
    Settings { path: String, reason: String },

    /// A blocking worker task panicked or was cancelled.
    #[error("Background task for {operation} failed: {reason}")]
    Task { operation: String, reason: String },

    /// A bulk transfer gave up on a chunk.
    #[error("{operation} failed at offset 0x{offset:06X} after {attempts} attempt(s): {source}")]
    Transfer {
        operation: String,
        offset: u32,
        attempts: u32,
        #[source]
        source: Box<BpioError>,
    },
}

impl From<std::io::Error> for BpioError {
    fn from(source: std::io::Error) -> Self {
        BpioError::Link {
            operation: "serial I/O".into(),
            source,
        }
    }
}

impl From<serialport::Error> for BpioError {
    fn from(e: serialport::Error) -> Self {
        BpioError::Link {
            operation: "serial port".into(),
            source: e.into(),
        }
    }
}

impl BpioError {
    /// Wrap an I/O error with the operation that hit it.
    pub fn link(operation: &str, source: std::io::Error) -> Self {
        BpioError::Link {
            operation: operation.to_string(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BpioError::Link { .. }
            | BpioError::NoDeviceFound { .. }
            | BpioError::PortBusy { .. }
            | BpioError::PortPermissionDenied { .. }
            | BpioError::Closed { .. }
            | BpioError::Task { .. } => ErrorKind::Link,
            BpioError::Timeout { .. } => ErrorKind::TimedOut,
            BpioError::InvalidFrame { .. }
            | BpioError::FrameTooLarge { .. }
            | BpioError::Encode(_)
            | BpioError::Decode(_)
            | BpioError::Protocol { .. }
            | BpioError::UnexpectedResponse { .. }
            | BpioError::ShortRead { .. }
            | BpioError::LongRead { .. } => ErrorKind::Protocol,
            BpioError::WrongMode { .. }
            | BpioError::NoActiveMode { .. }
            | BpioError::ModeBusy { .. } => ErrorKind::WrongMode,
            BpioError::Verification { .. } => ErrorKind::Verification,
            BpioError::Device { .. } => ErrorKind::Device,
            BpioError::InvalidParameter { .. } | BpioError::Settings { .. } => {
                ErrorKind::InvalidParameter
            }
            BpioError::Transfer { source, .. } => source.kind(),
        }
    }

    /// Check if this error is retriable (transient errors that may succeed on retry).
    ///
    /// A closed session is a link failure but can never recover.
    pub fn is_retriable(&self) -> bool {
        match self {
            BpioError::Closed { .. } => false,
            BpioError::Transfer { .. } => false,
            BpioError::Task { .. } => false,
            _ => matches!(self.kind(), ErrorKind::TimedOut | ErrorKind::Link),
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            BpioError::Link { .. } => "BPIO-001",
            BpioError::NoDeviceFound { .. } => "BPIO-002",
            BpioError::PortBusy { .. } => "BPIO-003",
            BpioError::PortPermissionDenied { .. } => "BPIO-004",
            BpioError::Closed { .. } => "BPIO-005",
            BpioError::Task { .. } => "BPIO-006",
            BpioError::Timeout { .. } => "BPIO-010",
            BpioError::InvalidFrame { .. } => "BPIO-020",
            BpioError::FrameTooLarge { .. } => "BPIO-021",
            BpioError::Encode(_) => "BPIO-022",
            BpioError::Decode(_) => "BPIO-023",
            BpioError::Protocol { .. } => "BPIO-024",
            BpioError::UnexpectedResponse { .. } => "BPIO-025",
            BpioError::ShortRead { .. } => "BPIO-026",
            BpioError::LongRead { .. } => "BPIO-027",
            BpioError::WrongMode { .. } => "BPIO-030",
            BpioError::ModeBusy { .. } => "BPIO-031",
            BpioError::NoActiveMode { .. } => "BPIO-032",
            BpioError::Verification { .. } => "BPIO-040",
            BpioError::Device { .. } => "BPIO-050",
            BpioError::InvalidParameter { .. } => "BPIO-060",
            BpioError::Settings { .. } => "BPIO-061",
            BpioError::Transfer { .. } => "BPIO-070",
        }
    }

    /// Innermost error, unwrapping bulk transfer context.
    pub fn root_cause(&self) -> &BpioError {
        match self {
            BpioError::Transfer { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
