//! # Partlog
//! Client-side publish core for a partitioned, log-structured messaging service.
//!
//! A topic is split into a fixed but growable number of partitions. This crate
//! takes messages from an application, routes each one to a partition, and
//! publishes it through a per-partition publisher that batches messages and
//! keeps at most one batch in flight. Each publish resolves to the message's
//! [`MessageMetadata`]: the partition it landed on and the offset it was
//! assigned there.
//!
//! # Goals
//! - Per-key ordering: messages with the same ordering key always go to the
//!   same partition while the partition count is unchanged
//! - Accept messages before the partition count is known
//! - Pick up new partitions without restarting the publisher
//! - Transport-agnostic: the stream and control plane are traits
//!
//! ## Getting started
//!
//! Implement [`AdminConnection`](publisher::AdminConnection) for your control
//! plane and [`BatchSink`](publisher::BatchSink) for your publish stream, then
//! build a [`MultipartitionPublisher`](publisher::MultipartitionPublisher).
//! See the [`publisher`] module for a complete example.
//!
//! ## Logging
//! Everything is logged through [`tracing`](https://docs.rs/tracing).
//! Install a subscriber yourself or call [`telemetry::init_logging`].

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod publisher;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result, StatusCode};
pub use types::{Message, MessageMetadata, Offset, Partition, TopicPath};

pub mod prelude {
    //! Main exports for building a publisher.
    //!
    //! ```rust
    //! use partlog::prelude::*;
    //!
    //! let metadata: MessageMetadata = "3:42".parse().unwrap();
    //! assert_eq!(metadata.partition, Partition(3));
    //! ```
    pub use crate::error::{Error, Result, StatusCode};
    pub use crate::publisher::{
        AdminConnection, AlarmRegistry, BatchSink, BatchingPartitionPublisher,
        DefaultRoutingPolicy, LifecycleService, MultipartitionPublisher, PartitionPublisher,
        PublisherConfig, RoutingPolicy,
    };
    pub use crate::types::{Message, MessageMetadata, Offset, Partition, TopicPath};

    pub use bytes;
}
