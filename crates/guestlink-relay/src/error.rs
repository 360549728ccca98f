//! Error types for relay operations.

use guestlink_transport::TransportError;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Every dial attempt in the retry budget failed.
    ///
    /// Connection-scoped: the one session is abandoned, the daemon keeps
    /// accepting.
    #[error("dial failed after {attempts} attempts: {source}")]
    DialExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last dial error.
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed; no further connections can be accepted.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A datagram could not be delivered within the reconnect budget.
    ///
    /// The message is retained as pending and will be replayed before the
    /// next send; the caller is responsible for re-queuing its own copy.
    #[error("datagram send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Transport-level failure (channel misconfiguration is fatal).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
