//! Centralized service limits and configuration defaults.
//!
//! # Categories
//!
//! - **Service Limits**: hard limits enforced by the log service per publish request
//! - **Publisher Defaults**: partition discovery and batching defaults

// =============================================================================
// Service Limits
// =============================================================================

/// Maximum number of messages the service accepts in one publish request.
pub const MAX_MESSAGES_PER_BATCH: usize = 1000;

/// Maximum serialized size of one publish request (3.5 MiB).
pub const MAX_BYTES_PER_BATCH: usize = 3_670_016;

// =============================================================================
// Publisher Defaults
// =============================================================================

/// How often the partition count is re-polled while a publisher runs.
///
/// Topics can only gain partitions, so this is a safety net that picks up
/// growth without a push notification from the service.
pub const DEFAULT_PARTITION_POLL_INTERVAL_SECS: u64 = 60;

/// Default message count that triggers sending a batch.
pub const DEFAULT_BATCH_MAX_MESSAGES: usize = MAX_MESSAGES_PER_BATCH;

/// Default byte size that triggers sending a batch.
pub const DEFAULT_BATCH_MAX_BYTES: usize = MAX_BYTES_PER_BATCH;

/// Default upper bound on how long a message waits in a partial batch.
pub const DEFAULT_BATCH_MAX_DELAY_MS: u64 = 50;
