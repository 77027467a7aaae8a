//! # PaSD MCCS Error Handling
//!
//! One crate-wide error type covering every failure mode of the station
//! control plane: Modbus-ASCII frame parsing, transaction pairing on the
//! shared bus, threshold configuration, the discovery procedure, the breaker
//! reset policy, and the SID-facing slave surface.
//!
//! ## Error categories
//!
//! ### Frame decode errors
//! Raised by the codec in [`crate::protocol`] and never retried
//! automatically; the transaction layer drains the inbound buffer to the
//! next `:` and the caller decides what to do.
//! - `FrameTooShort`, `BadStartChar`, `OddHex`, `BadHexDigit`,
//!   `MissingCrlf`, `LrcMismatch`
//!
//! ### Transaction errors
//! Raised by [`crate::transport::AsciiMaster`] when pairing a reply with a
//! request on the half-duplex bus.
//! - `Timeout`, `AddressMismatch`, `FunctionMismatch`, `ExceptionResponse`,
//!   `Busy`, `InvalidRange`
//!
//! ### Station-level conditions
//! Raised by the orchestrator and the slave surface.
//! - `AmbiguousMapping`, `BreakerPersistent`, `MapInconsistent`,
//!   `CursorUnprimed`, `StaleMirror`
//!
//! ## Recoverability
//!
//! ```rust
//! use pasd_mccs::error::PasdError;
//!
//! let err = PasdError::timeout("read polled block", 500);
//! assert!(err.is_recoverable());
//!
//! let err = PasdError::LrcMismatch { expected: 0xF4, actual: 0xF5 };
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for all MCCS operations
pub type PasdResult<T> = Result<T, PasdError>;

/// Errors raised anywhere in the PaSD station control plane
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PasdError {
    /// I/O failure on a byte-stream endpoint (bridge socket, listener)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Endpoint connection establishment or loss
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Decoded fewer than the 4 bytes (address, function, payload, LRC)
    /// a minimal frame needs
    #[error("Frame too short: {length} bytes")]
    FrameTooShort { length: usize },

    /// No `:` start delimiter found in the inbound data
    #[error("Missing ':' frame start")]
    BadStartChar,

    /// Odd number of hex nibbles between `:` and CRLF
    #[error("Odd hex digit count: {length}")]
    OddHex { length: usize },

    /// A character between `:` and CRLF is not an ASCII hex digit
    #[error("Bad hex digit {byte:#04X} at offset {offset}")]
    BadHexDigit { byte: u8, offset: usize },

    /// Frame not terminated by CR LF
    #[error("Missing CRLF frame terminator")]
    MissingCrlf,

    /// LRC byte does not match the two's-complement sum of the frame
    #[error("LRC mismatch: expected {expected:#04X}, actual {actual:#04X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// No matching reply before the transaction deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A complete, LRC-valid reply arrived from the wrong station
    #[error("Address mismatch: sent to {expected}, reply from {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    /// Reply function code is neither the request's nor its exception form
    #[error("Function mismatch: expected {expected:#04X}, reply {actual:#04X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    /// Device answered with a Modbus exception frame
    #[error("Exception response: function={function:#04X}, code={code:#04X}")]
    ExceptionResponse { function: u8, code: u8 },

    /// Register number, count, or threshold ordering rejected before send
    #[error("Invalid range: {message}")]
    InvalidRange { message: String },

    /// A transaction is already in flight on this endpoint
    #[error("Endpoint busy: a transaction is already outstanding")]
    Busy,

    /// Two SMARTboxes booted within the tie window on the same PDoC port
    #[error("Ambiguous PDoC mapping on port {port}: addresses {first} and {second} tied")]
    AmbiguousMapping { port: u8, first: u8, second: u8 },

    /// Breaker re-latched after the full reset budget was spent
    #[error("Breaker persistent on SMARTbox {address} port {port} after {attempts} resets")]
    BreakerPersistent { address: u8, port: u8, attempts: u8 },

    /// An antenna-map write would duplicate a (SMARTbox, port) pair
    #[error("Antenna map inconsistent at register {register}: ({smartbox}, {port}) already assigned")]
    MapInconsistent { register: u16, smartbox: u8, port: u8 },

    /// Service-log block read before a cursor was primed on this session
    #[error("Service log cursor not primed")]
    CursorUnprimed,

    /// Device mirror has missed three consecutive polls
    #[error("Stale mirror for device {address}: last good poll at {readtime}")]
    StaleMirror { address: u8, readtime: i64 },

    /// Client or server configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Library internal error (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PasdError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid range error
    pub fn invalid_range<S: Into<String>>(message: S) -> Self {
        Self::InvalidRange { message: message.into() }
    }

    /// Create an exception response error from the raw reply bytes
    pub fn exception(function: u8, code: u8) -> Self {
        Self::ExceptionResponse { function, code }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is worth retrying
    ///
    /// Timeouts and transport hiccups on the shared bus are routinely
    /// transient (the SID may be holding the bus); frame decode failures
    /// and protocol violations are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Busy => true,
            Self::AddressMismatch { .. } => true,
            Self::StaleMirror { .. } => true,
            _ => false,
        }
    }

    /// Check if the error is a transport-level issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Busy
        )
    }

    /// Check if the error came from frame decoding
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::BadStartChar
                | Self::OddHex { .. }
                | Self::BadHexDigit { .. }
                | Self::MissingCrlf
                | Self::LrcMismatch { .. }
        )
    }

    /// Check if the error is a protocol-level issue
    pub fn is_protocol_error(&self) -> bool {
        self.is_decode_error()
            || matches!(
                self,
                Self::AddressMismatch { .. }
                    | Self::FunctionMismatch { .. }
                    | Self::ExceptionResponse { .. }
            )
    }
}

impl From<std::io::Error> for PasdError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PasdError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation deadline", 0)
    }
}

impl From<serde_json::Error> for PasdError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = PasdError::timeout("poll SMARTbox 3", 500);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = PasdError::exception(0x83, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = PasdError::BadHexDigit { byte: b'G', offset: 4 };
        assert!(err.is_decode_error());
        assert!(!err.is_transport_error());
    }

    #[test]
    fn test_error_display() {
        let err = PasdError::LrcMismatch { expected: 0xF4, actual: 0x12 };
        let msg = format!("{}", err);
        assert!(msg.contains("0xF4"));
        assert!(msg.contains("0x12"));

        let err = PasdError::MapInconsistent { register: 42, smartbox: 3, port: 5 };
        assert!(format!("{}", err).contains("register 42"));
    }

    #[test]
    fn test_busy_is_recoverable() {
        assert!(PasdError::Busy.is_recoverable());
        assert!(!PasdError::CursorUnprimed.is_recoverable());
    }
}
