//! Error types for transport operations.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A guest address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A 9P channel file the server was expected to provide is missing.
    ///
    /// This indicates a bug or misconfiguration on the counterpart side and
    /// is treated as fatal by callers.
    #[error("channel file missing: {0}")]
    ChannelMissing(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
