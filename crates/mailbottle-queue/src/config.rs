//! Queue configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for [`MemoryQueue`](crate::MemoryQueue).
///
/// ```json
/// { "capacity": 1000, "lease_secs": 300 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Maximum number of queued bottles (omit for unlimited).
    pub capacity: Option<usize>,
    /// How long a polled bottle stays hidden from other polls, in seconds.
    pub lease_secs: u64,
    /// Largest accepted bottle record, in bytes.
    pub max_record_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            lease_secs: 300,
            max_record_size: 32 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    /// Sets the capacity limit.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the lease duration (whole seconds).
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.lease_secs = lease.as_secs();
        self
    }

    /// Sets the largest accepted record.
    #[must_use]
    pub const fn max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Lease duration.
    #[must_use]
    pub const fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial() {
        let config: QueueConfig = serde_json::from_str(r#"{ "capacity": 10 }"#).unwrap();
        assert_eq!(config.capacity, Some(10));
        assert_eq!(config.lease_secs, 300);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(serde_json::from_str::<QueueConfig>(r#"{ "capacty": 10 }"#).is_err());
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::default()
            .capacity(5)
            .lease(Duration::from_secs(30));
        assert_eq!(config.capacity, Some(5));
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
    }
}
