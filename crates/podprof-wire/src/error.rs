//! Wire-level error types.

use thiserror::Error;

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while reading or writing protocol fields.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer stopped sending mid-field for longer than the socket
    /// read deadline.
    #[error("timeout while waiting for data from socket")]
    Timeout,

    /// Clean end-of-input where more bytes were required.
    #[error("end of input")]
    Eof,

    /// Malformed or out-of-contract bytes; fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("field of {len} bytes exceeds max length of {max}")]
    FieldTooLong { len: usize, max: usize },
}

impl WireError {
    /// True for failures that indicate the socket itself is gone rather
    /// than a protocol violation.
    pub fn is_socket_failure(&self) -> bool {
        matches!(self, WireError::Io(_) | WireError::Timeout | WireError::Eof)
    }
}
