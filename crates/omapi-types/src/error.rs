//! Shared error types for OMAPI.

use thiserror::Error;

/// Top-level error type for the object management protocol.
#[derive(Error, Debug)]
pub enum OmapiError {
    /// A transport error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No layer in an object chain handled the request.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The object is not layered on a live connection.
    #[error("Not connected")]
    NotConnected,

    /// The connection was closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer announced a protocol version we do not speak.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our protocol version.
        local: u32,
        /// The version the peer announced.
        remote: u32,
    },

    /// The peer sent something that violates the wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A caller passed a value of the wrong shape.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the OMAPI crates.
pub type OmapiResult<T> = Result<T, OmapiError>;

/// Result codes carried in the `result` attribute of a STATUS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    NotFound = 1,
    NotConnected = 2,
    ConnectionClosed = 3,
    VersionMismatch = 4,
    ProtocolError = 5,
    InvalidArgument = 6,
    NoMemory = 7,
    Unexpected = 8,
}

impl StatusCode {
    /// Decode a wire value. Unknown codes map to [`StatusCode::Unexpected`].
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::NotConnected,
            3 => Self::ConnectionClosed,
            4 => Self::VersionMismatch,
            5 => Self::ProtocolError,
            6 => Self::InvalidArgument,
            7 => Self::NoMemory,
            _ => Self::Unexpected,
        }
    }

    /// The wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<&OmapiError> for StatusCode {
    fn from(err: &OmapiError) -> Self {
        match err {
            OmapiError::NotFound(_) => Self::NotFound,
            OmapiError::NotConnected => Self::NotConnected,
            OmapiError::ConnectionClosed => Self::ConnectionClosed,
            OmapiError::VersionMismatch { .. } => Self::VersionMismatch,
            OmapiError::Protocol(_) => Self::ProtocolError,
            OmapiError::InvalidArgument(_) => Self::InvalidArgument,
            OmapiError::Io(_) | OmapiError::Config(_) => Self::Unexpected,
        }
    }
}
