//! Traits at the seams of the publish path.
//!
//! These traits abstract the collaborators the orchestration core drives
//! without implementing them: the per-partition stream, the control-plane
//! connection, the timer, and the batch transport. This allows:
//! - Plugging in any transport (gRPC stream, in-process broker, ...)
//! - Testing with the in-memory mocks in [`mock`](super::mock)
//!
//! # Eager vs. lazy futures
//!
//! [`LifecycleService`] and [`PartitionPublisher`] return `'static` boxed
//! futures instead of using `async fn`. The call itself performs the work
//! (accepting a message, registering for start) and the returned future only
//! observes the outcome. Publish order is therefore the order of calls, not
//! the order in which the returned futures are first polled.
//!
//! [`AdminConnection`], [`TimerService`] and [`BatchSink`] are plain
//! `async_trait` traits: callers always spawn or await them immediately and
//! never rely on call order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Message, Offset, TopicPath};

/// A component with a start/shutdown lifecycle.
pub trait LifecycleService: Send + Sync {
    /// Start the service.
    ///
    /// The returned future resolves when the service terminates: `Ok(())`
    /// after a requested shutdown, `Err(_)` if it failed permanently.
    fn start(&self) -> BoxFuture<'static, Result<()>>;

    /// Stop the service, waiting until outstanding work has been resolved.
    fn shutdown(&self) -> BoxFuture<'static, ()>;
}

/// Publishes messages to a single partition.
pub trait PartitionPublisher: LifecycleService {
    /// Accept a message for publishing.
    ///
    /// Messages are published in call order. The future resolves with the
    /// offset assigned by the service or a permanent error.
    fn publish(&self, message: Message) -> BoxFuture<'static, Result<Offset>>;

    /// Send any buffered messages without waiting for batching thresholds.
    fn flush(&self);
}

/// Control-plane connection used for partition discovery.
#[async_trait]
pub trait AdminConnection: Send + Sync {
    /// Get the current partition count of a topic.
    async fn get_topic_partitions(&self, topic: &TopicPath) -> Result<u32>;
}

/// Relative timer used by the alarm registry.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Sleep for `period`.
    ///
    /// An error means the timer can no longer fire (for instance because the
    /// executor is shutting down).
    async fn sleep(&self, period: Duration) -> Result<()>;
}

/// Timer backed by the tokio time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl TimerService for TokioTimer {
    async fn sleep(&self, period: Duration) -> Result<()> {
        tokio::time::sleep(period).await;
        Ok(())
    }
}

/// A transport that publishes one request (a batch) at a time.
#[async_trait]
pub trait BatchSink: Send + Sync {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Publish a request and wait for the service's response.
    async fn publish(&self, request: Self::Request) -> Result<Self::Response>;

    /// Allow publishing to resume for `ordering_key` after a failure.
    fn resume_publish(&self, ordering_key: &str);
}
