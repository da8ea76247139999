//! Daemon configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use mailbottle::{ClientConfig, ServerConfig};
use mailbottle_queue::QueueConfig;
use mailbottle_smtp::{SmtpConfig, load_tls};
use serde::Deserialize;

/// Everything `bottled` reads from its JSON configuration file.
///
/// ```json
/// {
///   "hostname": "mx.example.org",
///   "smtp_listen": "0.0.0.0:25",
///   "bottle_listen": "127.0.0.1:2526",
///   "tls": { "cert": "/etc/bottled/cert.pem", "key": "/etc/bottled/key.pem" },
///   "queue": { "capacity": 10000 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Name announced to SMTP clients.
    pub hostname: String,
    /// SMTP listen address; omit to disable SMTP.
    pub smtp_listen: Option<SocketAddr>,
    /// Bottle protocol listen address; omit to disable it.
    pub bottle_listen: Option<SocketAddr>,
    /// Bottle server to hand SMTP mail to instead of the local queue.
    pub upstream: Option<SocketAddr>,
    /// Certificate and key for STARTTLS.
    pub tls: Option<TlsFiles>,
    /// Local queue settings.
    pub queue: QueueConfig,
    /// Bottle protocol limits.
    pub bottle: BottleSettings,
    /// SMTP limits.
    pub smtp: SmtpSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            smtp_listen: Some(SocketAddr::from(([127, 0, 0, 1], 2525))),
            bottle_listen: Some(SocketAddr::from(([127, 0, 0, 1], 2526))),
            upstream: None,
            tls: None,
            queue: QueueConfig::default(),
            bottle: BottleSettings::default(),
            smtp: SmtpSettings::default(),
        }
    }
}

/// PEM files for STARTTLS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key.
    pub key: PathBuf,
}

/// Bottle protocol limits, timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BottleSettings {
    /// Commands handled at once per connection.
    pub max_in_flight: usize,
    /// Wait for the next command.
    pub read_timeout: u64,
    /// Time to write one reply.
    pub write_timeout: u64,
    /// Time for one backend call.
    pub request_timeout: u64,
}

impl Default for BottleSettings {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            max_in_flight: server.max_in_flight,
            read_timeout: server.read_timeout.as_secs(),
            write_timeout: server.write_timeout.as_secs(),
            request_timeout: server.request_timeout.as_secs(),
        }
    }
}

/// SMTP limits, timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmtpSettings {
    /// Wait for the next command.
    pub command_timeout: u64,
    /// Time for one DATA transfer.
    pub data_timeout: u64,
    /// Bytes buffered between a session and its backend.
    pub pipe_capacity: usize,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        let smtp = SmtpConfig::default();
        Self {
            command_timeout: smtp.command_timeout.as_secs(),
            data_timeout: smtp.data_timeout.as_secs(),
            pipe_capacity: smtp.pipe_capacity,
        }
    }
}

impl DaemonConfig {
    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Settings for Bottle protocol connections.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new()
            .max_in_flight(self.bottle.max_in_flight)
            .read_timeout(Duration::from_secs(self.bottle.read_timeout))
            .write_timeout(Duration::from_secs(self.bottle.write_timeout))
            .request_timeout(Duration::from_secs(self.bottle.request_timeout))
    }

    /// Settings for upstream connections.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default().max_in_flight(self.bottle.max_in_flight)
    }

    /// Settings for SMTP sessions, with the TLS material loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or key cannot be loaded.
    pub fn smtp_config(&self) -> anyhow::Result<SmtpConfig> {
        let mut config = SmtpConfig::new()
            .hostname(self.hostname.clone())
            .command_timeout(Duration::from_secs(self.smtp.command_timeout))
            .data_timeout(Duration::from_secs(self.smtp.data_timeout))
            .pipe_capacity(self.smtp.pipe_capacity);

        if let Some(files) = &self.tls {
            let tls = load_tls(&files.cert, &files.key).with_context(|| {
                format!(
                    "loading TLS from {} and {}",
                    files.cert.display(),
                    files.key.display()
                )
            })?;
            config = config.tls(tls);
        }
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: DaemonConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.hostname, "localhost");
        assert!(config.smtp_listen.is_some());
        assert!(config.upstream.is_none());
        assert_eq!(config.bottle.max_in_flight, 64);
    }

    #[test]
    fn test_full_file() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{
                "hostname": "mx.example.org",
                "smtp_listen": "0.0.0.0:25",
                "bottle_listen": null,
                "queue": { "capacity": 100, "lease_secs": 60 },
                "smtp": { "data_timeout": 30 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.smtp_listen, Some("0.0.0.0:25".parse().unwrap()));
        assert!(config.bottle_listen.is_none());
        assert_eq!(config.queue.capacity, Some(100));

        let smtp = config.smtp_config().unwrap();
        assert_eq!(smtp.hostname, "mx.example.org");
        assert_eq!(smtp.data_timeout, Duration::from_secs(30));
        assert!(smtp.tls.is_none());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(serde_json::from_str::<DaemonConfig>(r#"{ "hostnme": "x" }"#).is_err());
    }

    #[test]
    fn test_missing_tls_files() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{ "tls": { "cert": "/nonexistent/cert.pem", "key": "/nonexistent/key.pem" } }"#,
        )
        .unwrap();
        assert!(config.smtp_config().is_err());
    }
}
