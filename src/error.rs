//! Error types for packetwire.

use thiserror::Error;

/// Main error type for all packetwire operations.
///
/// Framing rejections are not represented here: the parser reports them as
/// `None`, and the client reports protocol-level failures through
/// [`SendResult`](crate::SendResult).
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Endpoint or packet configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload does not fit the length field or the configured maximum.
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: u64 },

    /// Reassembler queue or writer task is gone.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
