//! Configuration for publishers.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `PARTITION_POLL_INTERVAL_SECS` | 60 | How often the partition count is re-polled |
//! | `BATCH_MAX_MESSAGES` | 1000 | Messages that trigger sending a batch |
//! | `BATCH_MAX_BYTES` | 3670016 | Bytes that trigger sending a batch |
//! | `BATCH_MAX_DELAY_MS` | 50 | Longest time a message waits in a partial batch |
//!
//! ```rust,no_run
//! use partlog::publisher::PublisherConfig;
//!
//! let config = PublisherConfig::from_env().expect("invalid publisher configuration");
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_MAX_BYTES, DEFAULT_BATCH_MAX_DELAY_MS, DEFAULT_BATCH_MAX_MESSAGES,
    DEFAULT_PARTITION_POLL_INTERVAL_SECS, MAX_BYTES_PER_BATCH, MAX_MESSAGES_PER_BATCH,
};
use crate::error::{Error, Result};

/// Thresholds that cut a batch in a partition publisher.
///
/// A batch is sent as soon as any threshold is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingSettings {
    /// Maximum messages per batch. Capped by the service limit.
    pub max_messages: usize,

    /// Maximum bytes per batch. Capped by the service limit.
    pub max_bytes: usize,

    /// Maximum time a message waits before its batch is sent.
    pub max_delay: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_BATCH_MAX_MESSAGES,
            max_bytes: DEFAULT_BATCH_MAX_BYTES,
            max_delay: Duration::from_millis(DEFAULT_BATCH_MAX_DELAY_MS),
        }
    }
}

/// Configuration for a [`MultipartitionPublisher`](super::MultipartitionPublisher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// How often the partition count is re-polled.
    pub partition_poll_interval: Duration,

    /// Batching thresholds for partition publishers.
    pub batching: BatchingSettings,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            partition_poll_interval: Duration::from_secs(DEFAULT_PARTITION_POLL_INTERVAL_SECS),
            batching: BatchingSettings::default(),
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{raw}'"))),
    }
}

impl PublisherConfig {
    /// Validate the configuration.
    ///
    /// Returns every problem found, not just the first one.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.partition_poll_interval.is_zero() {
            errors.push("partition_poll_interval must be greater than zero".to_string());
        }
        if self.batching.max_messages == 0 {
            errors.push("batching.max_messages must be greater than zero".to_string());
        }
        if self.batching.max_messages > MAX_MESSAGES_PER_BATCH {
            errors.push(format!(
                "batching.max_messages ({}) exceeds the service limit of {}",
                self.batching.max_messages, MAX_MESSAGES_PER_BATCH
            ));
        }
        if self.batching.max_bytes == 0 {
            errors.push("batching.max_bytes must be greater than zero".to_string());
        }
        if self.batching.max_bytes > MAX_BYTES_PER_BATCH {
            errors.push(format!(
                "batching.max_bytes ({}) exceeds the service limit of {}",
                self.batching.max_bytes, MAX_BYTES_PER_BATCH
            ));
        }
        if self.batching.max_delay.is_zero() {
            errors.push("batching.max_delay must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source and validate it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let poll_secs = parse_var(
            &lookup,
            "PARTITION_POLL_INTERVAL_SECS",
            DEFAULT_PARTITION_POLL_INTERVAL_SECS,
        )?;
        let max_messages = parse_var(&lookup, "BATCH_MAX_MESSAGES", DEFAULT_BATCH_MAX_MESSAGES)?;
        let max_bytes = parse_var(&lookup, "BATCH_MAX_BYTES", DEFAULT_BATCH_MAX_BYTES)?;
        let max_delay_ms = parse_var(&lookup, "BATCH_MAX_DELAY_MS", DEFAULT_BATCH_MAX_DELAY_MS)?;

        let config = Self {
            partition_poll_interval: Duration::from_secs(poll_secs),
            batching: BatchingSettings {
                max_messages,
                max_bytes,
                max_delay: Duration::from_millis(max_delay_ms),
            },
        };

        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(config)
    }
}
