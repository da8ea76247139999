//! Error types for the SMTP front end.

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
///
/// Everything a client does wrong is answered with a reply code and never
/// surfaces here. These errors end the session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be used.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The client did not send a command or the message body in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid state for operation.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if the client went quiet.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
