//! Error handling for FabLink
//!
//! Provides error types for each layer of the connection stack:
//! - Connection errors (sockets, serial ports, HTTP)
//! - Protocol errors (malformed frames, unexpected replies)
//! - Channel errors (lifecycle, capability, timeout, integrity)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents transport-level failures: opening, reading from or writing to
/// a socket, serial port or HTTP endpoint.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Invalid hostname/IP
    #[error("Invalid hostname: {hostname}")]
    InvalidHostname {
        /// The invalid hostname or IP address.
        hostname: String,
    },

    /// TCP connection error
    #[error("TCP connection error: {reason}")]
    TcpError {
        /// The reason for the TCP error.
        reason: String,
    },

    /// UDP socket error
    #[error("UDP socket error: {reason}")]
    UdpError {
        /// The reason for the UDP error.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {reason}")]
    HttpError {
        /// The reason for the HTTP error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Protocol error type
///
/// Raised when bytes arrived but do not match the layout the protocol
/// expects: bad framing, bad checksums, short payloads, refusals.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame does not start with the expected magic bytes
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Header CRC-8 mismatch
    #[error("Header CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    HeaderCrcMismatch {
        /// CRC computed over the received header.
        expected: u8,
        /// CRC carried by the frame.
        actual: u8,
    },

    /// Payload checksum mismatch
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum computed over the received body.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// Buffer ended before a field could be read
    #[error("Truncated payload: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset of the field being read.
        offset: usize,
        /// Bytes needed for the field.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A string field is not valid UTF-8
    #[error("Invalid UTF-8 string at offset {offset}")]
    InvalidString {
        /// Offset of the string length prefix.
        offset: usize,
    },

    /// A value does not fit the wire field it is written to
    #[error("Value too large for field {field}: {len}")]
    FieldOverflow {
        /// The field being written.
        field: &'static str,
        /// The offending length or value.
        len: usize,
    },

    /// Remote answered with a non-zero result code
    #[error("Remote returned result code {code} for {command}")]
    ResultCode {
        /// Command identifier, formatted `set/id`.
        command: String,
        /// The result code.
        code: u8,
    },

    /// Reply could not be understood
    #[error("Malformed reply: {reason}")]
    Malformed {
        /// Description of the problem.
        reason: String,
    },
}

/// Channel error type
///
/// Represents errors raised by a protocol channel or its dispatcher:
/// lifecycle violations, unsupported capabilities, timeouts and integrity
/// failures.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Capability call before the handshake completed
    #[error("Channel not ready (state: {state})")]
    NotReady {
        /// The state the channel is in.
        state: String,
    },

    /// The manager has no ready connection
    #[error("Machine is not connected")]
    NotConnected,

    /// Invalid lifecycle transition
    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current state name.
        current: String,
        /// The requested state name.
        requested: String,
    },

    /// Capability not offered by the active protocol
    #[error("Unsupported event: {capability} is not available over {protocol}")]
    Unsupported {
        /// The capability or command requested.
        capability: String,
        /// The protocol in use.
        protocol: String,
    },

    /// Request was not answered in time
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Machine refused the command
    #[error("Command rejected: {reason}")]
    Rejected {
        /// The reason given by the machine.
        reason: String,
    },

    /// Transfer finished with a byte count that does not match the source
    #[error("Integrity check failed for {file}: expected {expected} bytes, transferred {actual}")]
    Integrity {
        /// File being transferred.
        file: String,
        /// Size of the file on disk.
        expected: u64,
        /// Bytes actually served.
        actual: u64,
    },

    /// Channel was disposed while the operation was pending
    #[error("Channel closed")]
    Closed,
}

/// Main error type for FabLink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Channel(ChannelError::Timeout { .. })
                | Error::Connection(ConnectionError::ConnectionTimeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if the active protocol does not offer the requested capability
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Unsupported { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
