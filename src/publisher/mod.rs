//! Partitioned publish orchestration.
//!
//! # Architecture
//!
//! ```text
//!   application
//!        │ publish(message)
//!        ▼
//!  ┌──────────────────────────┐   get_topic_partitions   ┌─────────────────┐
//!  │ MultipartitionPublisher  │ ───────────────────────▶ │ AdminConnection │
//!  │  pending queue + routing │ ◀─── poll alarm (60s) ── │  AlarmRegistry  │
//!  └────────────┬─────────────┘                          └─────────────────┘
//!               │ RoutingPolicy: key/round-robin → partition
//!      ┌────────┼────────┐
//!      ▼        ▼        ▼
//!   ┌─────┐  ┌─────┐  ┌─────┐   one PartitionPublisher per partition,
//!   │ P0  │  │ P1  │  │ P2  │   lifecycles composed by LifecycleAggregator
//!   └──┬──┘  └──┬──┘  └──┬──┘
//!      ▼        ▼        ▼
//!   SequentialBatchSink (one request in flight) → BatchSink transport
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use partlog::publisher::{
//!     AlarmRegistry, BatchingPartitionPublisher, DefaultRoutingPolicy,
//!     MultipartitionPublisher, PublisherConfig,
//! };
//! # use partlog::publisher::{AdminConnection, BatchSink};
//! # use partlog::{Message, TopicPath};
//! # use std::sync::Arc;
//! # async fn run<A, S>(admin: Arc<A>, transport: Arc<S>) -> partlog::Result<()>
//! # where
//! #     A: AdminConnection + 'static,
//! #     S: BatchSink<Request = partlog::publisher::MessageBatch, Response = partlog::Offset> + 'static,
//! # {
//! let handle = tokio::runtime::Handle::current();
//! let config = PublisherConfig::from_env()?;
//! let alarms = AlarmRegistry::new(handle.clone());
//!
//! let factory = BatchingPartitionPublisher::factory(
//!     move |_partition| transport.clone(),
//!     config.batching.clone(),
//!     alarms.clone(),
//!     handle.clone(),
//! );
//! let publisher = MultipartitionPublisher::new(
//!     TopicPath::new("my-project", "us-central1-a", "orders"),
//!     factory,
//!     admin,
//!     alarms,
//!     Arc::new(DefaultRoutingPolicy::new()),
//!     &config,
//!     handle,
//! );
//!
//! let _running = publisher.start();
//! let metadata = publisher
//!     .publish(Message::new("hello").with_ordering_key("customer-1"))
//!     .await?;
//! println!("published at {metadata}");
//! publisher.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod alarm;
mod batching;
mod config;
mod lifecycle;
mod multipartition;
mod routing;
mod sequential_sink;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

pub use alarm::{AlarmRegistry, CancelToken};
pub use batching::{BatchingPartitionPublisher, MessageBatch};
pub use config::{BatchingSettings, PublisherConfig};
pub use lifecycle::LifecycleAggregator;
pub use multipartition::{MultipartitionPublisher, PartitionPublisherFactory};
pub use routing::{DefaultRoutingPolicy, RoutingPolicy};
pub use sequential_sink::{CorkState, SequentialBatchSink};
pub use traits::{
    AdminConnection, BatchSink, LifecycleService, PartitionPublisher, TimerService, TokioTimer,
};

/// Await a result delivered through a oneshot channel.
///
/// A dropped sender means the producing task was torn down (for example the
/// runtime shut down) before it resolved the result.
pub(crate) fn receive_result<T: Send + 'static>(
    rx: oneshot::Receiver<Result<T>>,
) -> BoxFuture<'static, Result<T>> {
    async move {
        rx.await.unwrap_or_else(|_| {
            Err(Error::Cancelled(
                "operation dropped before completion".to_string(),
            ))
        })
    }
    .boxed()
}
