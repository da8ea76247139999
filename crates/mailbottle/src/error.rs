//! Error types for the Bottle protocol library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while speaking the Bottle protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was shut down while waiting for a pipeline turn.
    #[error("connection closed")]
    Closed,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol violation or unexpected data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a failure reply.
    #[error("Bottle error {code}: {message}")]
    Remote {
        /// Reply code (e.g., 501).
        code: u16,
        /// Reply text from the peer.
        message: String,
    },
}

impl Error {
    /// Creates a remote error from a reply code and message.
    #[must_use]
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Returns true if the peer asked us to retry later (code 301).
    #[must_use]
    pub const fn is_try_again(&self) -> bool {
        matches!(self, Self::Remote { code: 301, .. })
    }

    /// Returns true if the error leaves the connection unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Remote { .. })
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
