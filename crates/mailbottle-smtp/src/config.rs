//! Session configuration.

use std::sync::Arc;
use std::time::Duration;

use mailbottle::framed::DEFAULT_MAX_LINE_LENGTH;

use crate::types::Extension;

/// SMTP front end configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Name announced in the greeting and the EHLO reply.
    pub hostname: String,
    /// Server TLS settings. STARTTLS is only offered when present.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// How long to wait for the next command.
    pub command_timeout: Duration,
    /// How long one DATA transfer may take, backend included.
    pub data_timeout: Duration,
    /// Capacity of the pipe between the session and the backend, in bytes.
    pub pipe_capacity: usize,
    /// Maximum command line length.
    pub max_line_length: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            tls: None,
            command_timeout: Duration::from_secs(300),
            data_timeout: Duration::from_secs(600),
            pipe_capacity: 64 * 1024,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl SmtpConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the announced hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Enables STARTTLS with the given server settings.
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the DATA timeout.
    #[must_use]
    pub const fn data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Sets the backend pipe capacity.
    #[must_use]
    pub const fn pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Sets the maximum command line length.
    #[must_use]
    pub const fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }

    /// Extensions announced in an EHLO reply on a connection that is
    /// encrypted or not.
    #[must_use]
    pub fn extensions(&self, encrypted: bool) -> Vec<Extension> {
        let mut extensions = vec![Extension::EightBitMime];
        if self.tls.is_some() && !encrypted {
            extensions.push(Extension::StartTls);
        }
        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SmtpConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert!(config.tls.is_none());
        assert_eq!(config.extensions(false), vec![Extension::EightBitMime]);
    }

    #[test]
    fn test_builder() {
        let config = SmtpConfig::new()
            .hostname("mx.example.org")
            .command_timeout(Duration::from_secs(5))
            .pipe_capacity(1024);
        assert_eq!(config.hostname, "mx.example.org");
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.pipe_capacity, 1024);
    }
}
