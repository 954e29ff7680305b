//! Publishing to every partition of a topic.
//!
//! Responsibilities:
//! - Discover the partition count, and re-poll it so growth is picked up
//! - Create and own one partition publisher per partition
//! - Buffer messages until at least one partition is known, then route them
//! - Resolve every publish exactly once, including across shutdown
//!
//! # Locking
//!
//! One mutex guards the pending queue, the partition publishers and the
//! outstanding-query flag. It is only held for bookkeeping; partition
//! publishers, the admin connection and the lifecycle aggregator are always
//! called with it released.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, warn};

use super::alarm::{AlarmRegistry, CancelToken};
use super::config::PublisherConfig;
use super::lifecycle::LifecycleAggregator;
use super::receive_result;
use super::routing::RoutingPolicy;
use super::traits::{AdminConnection, LifecycleService, PartitionPublisher};
use crate::error::{Error, Result};
use crate::types::{Message, MessageMetadata, Partition, TopicPath};

/// Creates the publisher for one partition.
pub type PartitionPublisherFactory<P> = Box<dyn Fn(Partition) -> Arc<P> + Send + Sync>;

/// A message waiting to be routed.
struct PendingMessage {
    message: Message,
    tx: oneshot::Sender<Result<MessageMetadata>>,
}

struct PublisherState<P> {
    /// Indexed by partition. Append-only.
    partition_publishers: Vec<Arc<P>>,
    /// Messages not yet handed to a partition publisher, in publish order.
    pending: VecDeque<PendingMessage>,
    /// A partition-count query is in flight.
    outstanding_query: bool,
    /// A drain loop is running.
    draining: bool,
    /// Terminal status once the publisher stopped accepting messages.
    closed: Option<Error>,
}

struct Inner<P: PartitionPublisher + 'static> {
    handle: Handle,
    topic: TopicPath,
    factory: PartitionPublisherFactory<P>,
    admin: Arc<dyn AdminConnection>,
    routing: Arc<dyn RoutingPolicy>,
    lifecycle: LifecycleAggregator,
    state: Mutex<PublisherState<P>>,
    query_done: Notify,
}

struct PollAlarm {
    token: Option<CancelToken>,
    closed: bool,
}

/// Publishes to a topic whose partition count may start unknown and grow.
///
/// Must be shut down with [`shutdown`](Self::shutdown) before it is dropped.
pub struct MultipartitionPublisher<P: PartitionPublisher + 'static> {
    // Declared before `inner`: the token is dropped (and the alarm cancelled)
    // before the state its callback reaches.
    poll_alarm: Mutex<PollAlarm>,
    alarms: AlarmRegistry,
    poll_interval: Duration,
    shutdown_complete: Arc<AtomicBool>,
    inner: Arc<Inner<P>>,
}

impl<P: PartitionPublisher + 'static> MultipartitionPublisher<P> {
    pub fn new(
        topic: TopicPath,
        factory: PartitionPublisherFactory<P>,
        admin: Arc<dyn AdminConnection>,
        alarms: AlarmRegistry,
        routing: Arc<dyn RoutingPolicy>,
        config: &PublisherConfig,
        handle: Handle,
    ) -> Self {
        let lifecycle = LifecycleAggregator::new(handle.clone());
        Self {
            poll_alarm: Mutex::new(PollAlarm {
                token: None,
                closed: false,
            }),
            alarms,
            poll_interval: config.partition_poll_interval,
            shutdown_complete: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Inner {
                handle,
                topic,
                factory,
                admin,
                routing,
                lifecycle,
                state: Mutex::new(PublisherState {
                    partition_publishers: Vec::new(),
                    pending: VecDeque::new(),
                    outstanding_query: false,
                    draining: false,
                    closed: None,
                }),
                query_done: Notify::new(),
            }),
        }
    }

    /// Start publishing.
    ///
    /// Starts every known partition publisher, queries the partition count
    /// right away and every poll interval after that. Resolves when the
    /// publisher terminates: `Ok(())` after `shutdown`, the failure otherwise.
    pub fn start(&self) -> BoxFuture<'static, Result<()>> {
        let started = self.inner.lifecycle.start();

        {
            let mut alarm = self.poll_alarm.lock();
            if !alarm.closed && alarm.token.is_none() {
                let weak: Weak<Inner<P>> = Arc::downgrade(&self.inner);
                alarm.token = Some(self.alarms.register_alarm(self.poll_interval, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.trigger_publisher_creation();
                    }
                }));
            }
        }

        info!(topic = %self.inner.topic, "Starting multipartition publisher");
        self.inner.trigger_publisher_creation();
        started
    }

    /// Publish `message` to the partition chosen by the routing policy.
    ///
    /// Messages published before the partition count is known are held and
    /// routed, in order, once it is.
    pub fn publish(&self, message: Message) -> BoxFuture<'static, Result<MessageMetadata>> {
        if let Some(status) = self.inner.lifecycle.status() {
            return future::ready(Err(status)).boxed();
        }

        let (tx, rx) = oneshot::channel();
        let routable = {
            let mut state = self.inner.state.lock();
            if let Some(status) = &state.closed {
                return future::ready(Err(status.clone())).boxed();
            }
            state.pending.push_back(PendingMessage { message, tx });
            !state.partition_publishers.is_empty()
        };

        if routable {
            self.inner.drain_pending_queue();
        }
        receive_result(rx)
    }

    /// Flush every partition publisher.
    pub fn flush(&self) {
        let publishers = self.inner.state.lock().partition_publishers.clone();
        for publisher in publishers {
            publisher.flush();
        }
    }

    /// Stop publishing.
    ///
    /// Cancels partition polling, shuts down every partition publisher, fails
    /// every message still waiting for a partition with the terminal status,
    /// and waits for an in-flight partition-count query before completing.
    pub fn shutdown(&self) -> BoxFuture<'static, ()> {
        let token = {
            let mut alarm = self.poll_alarm.lock();
            alarm.closed = true;
            alarm.token.take()
        };
        // Blocks until a firing callback, if any, has returned.
        drop(token);

        // Close before the aggregator terminates: from here on a finishing
        // partition query cannot add publishers the aggregator would reject.
        let status = self.inner.lifecycle.status().unwrap_or(Error::Shutdown);
        let failed = self.inner.close(status.clone());
        let children = self.inner.lifecycle.shutdown();
        if failed > 0 {
            info!(
                topic = %self.inner.topic,
                messages = failed,
                status = %status,
                "Failed pending messages on shutdown"
            );
        }

        let inner = self.inner.clone();
        let complete = self.shutdown_complete.clone();
        async move {
            children.await;
            inner.wait_for_outstanding_query().await;
            complete.store(true, Ordering::Release);
            debug!(topic = %inner.topic, "Multipartition publisher shut down");
        }
        .boxed()
    }

    /// Number of partition publishers created so far.
    pub fn partition_count(&self) -> usize {
        self.inner.state.lock().partition_publishers.len()
    }

    /// The publisher for `partition`, if it was created.
    pub fn partition_publisher(&self, partition: Partition) -> Option<Arc<P>> {
        self.inner
            .state
            .lock()
            .partition_publishers
            .get(partition.index())
            .cloned()
    }

    /// Messages waiting for a partition.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// The terminal status, or `None` while running.
    pub fn status(&self) -> Option<Error> {
        self.inner.lifecycle.status()
    }
}

impl<P: PartitionPublisher + 'static> Drop for MultipartitionPublisher<P> {
    fn drop(&mut self) {
        if !self.shutdown_complete.load(Ordering::Acquire) && !std::thread::panicking() {
            error!(
                topic = %self.inner.topic,
                "Multipartition publisher dropped before shutdown completed"
            );
            debug_assert!(
                self.shutdown_complete.load(Ordering::Acquire),
                "MultipartitionPublisher must be shut down before it is dropped"
            );
        }
    }
}

impl<P: PartitionPublisher + 'static> Inner<P> {
    /// Query the partition count unless a query is already in flight.
    fn trigger_publisher_creation(self: &Arc<Self>) {
        let terminated = self.lifecycle.status().is_some();
        {
            let mut state = self.state.lock();
            if terminated || state.outstanding_query || state.closed.is_some() {
                return;
            }
            state.outstanding_query = true;
        }

        let inner = self.clone();
        self.handle.spawn(async move {
            let result = inner.admin.get_topic_partitions(&inner.topic).await;
            let orphans = inner.on_partition_count(result);
            future::join_all(orphans).await;
            inner.finish_query();
        });
    }

    /// Apply a partition-count query result.
    ///
    /// Returns the shutdowns of publishers the aggregator rejected; the query
    /// is not finished until they complete.
    fn on_partition_count(self: &Arc<Self>, result: Result<u32>) -> Vec<BoxFuture<'static, ()>> {
        let e = match result {
            Ok(count) => return self.create_publishers(count),
            Err(e) => e,
        };

        let known = self.state.lock().partition_publishers.len();
        if known > 0 {
            warn!(
                topic = %self.topic,
                partitions = known,
                error = %e,
                "Failed to refresh partition count, retrying on next poll"
            );
        } else {
            error!(
                topic = %self.topic,
                error = %e,
                "Failed to get initial partition count"
            );
            self.lifecycle.abort(e.clone());
            self.close(e);
        }
        Vec::new()
    }

    /// Create publishers for partitions `[known, count)` and drain the queue.
    ///
    /// New publishers are registered with the aggregator only after they are
    /// in the partition table. A concurrent shutdown therefore either shuts
    /// them down through the aggregator or has the aggregator reject them, in
    /// which case their shutdowns are returned to the caller.
    fn create_publishers(self: &Arc<Self>, count: u32) -> Vec<BoxFuture<'static, ()>> {
        let terminated = self.lifecycle.status().is_some();
        let known = {
            let state = self.state.lock();
            if terminated || state.closed.is_some() {
                return Vec::new();
            }
            state.partition_publishers.len()
        };

        let count = count as usize;
        if count < known {
            warn!(
                topic = %self.topic,
                known,
                reported = count,
                "Ignoring partition count decrease"
            );
            return Vec::new();
        }
        if count == known {
            return Vec::new();
        }

        let created: Vec<Arc<P>> = (known..count)
            .map(|index| (self.factory)(Partition(index as u32)))
            .collect();

        {
            let terminated = self.lifecycle.status().is_some();
            let mut state = self.state.lock();
            if terminated || state.closed.is_some() {
                debug!(
                    topic = %self.topic,
                    discarded = created.len(),
                    "Discarding partition publishers created after close"
                );
                return Vec::new();
            }
            state.partition_publishers.extend(created.iter().cloned());
        }

        let mut orphans = Vec::new();
        for publisher in &created {
            let service: Arc<dyn LifecycleService> = publisher.clone();
            if !self.lifecycle.add_service(Arc::downgrade(&service)) {
                orphans.push(publisher.shutdown());
            }
        }

        if orphans.is_empty() {
            info!(
                topic = %self.topic,
                partitions = count,
                added = count - known,
                "Partition publishers created"
            );
        } else {
            warn!(
                topic = %self.topic,
                orphaned = orphans.len(),
                "Publisher terminated while creating partition publishers, shutting them down"
            );
        }
        self.drain_pending_queue();
        orphans
    }

    /// Route every pending message.
    ///
    /// The queue and the partition snapshot are taken together under the
    /// lock; routing happens with the lock released. Messages that arrive
    /// during a drain are picked up by the next iteration.
    fn drain_pending_queue(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let (batch, publishers) = {
                let mut state = self.state.lock();
                if state.pending.is_empty() || state.partition_publishers.is_empty() {
                    state.draining = false;
                    return;
                }
                (
                    std::mem::take(&mut state.pending),
                    state.partition_publishers.clone(),
                )
            };

            for pending in batch {
                self.route_and_publish(pending, &publishers);
            }
        }
    }

    fn route_and_publish(&self, pending: PendingMessage, publishers: &[Arc<P>]) {
        let count = publishers.len() as u32;
        let partition = match pending.message.ordering_key() {
            Some(key) => self.routing.route_key(key, count),
            None => self.routing.route(count),
        };

        let Some(publisher) = publishers.get(partition.index()) else {
            let _ = pending.tx.send(Err(Error::Internal(format!(
                "routing policy chose partition {partition} of {count}"
            ))));
            return;
        };

        let published = publisher.publish(pending.message);
        let tx = pending.tx;
        self.handle.spawn(async move {
            let result = published
                .await
                .map(|offset| MessageMetadata::new(partition, offset));
            let _ = tx.send(result);
        });
    }

    /// Stop accepting messages and fail everything still pending with `status`.
    ///
    /// Returns the number of messages failed.
    fn close(&self, status: Error) -> usize {
        let pending = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(status.clone());
            }
            std::mem::take(&mut state.pending)
        };

        let failed = pending.len();
        for message in pending {
            let _ = message.tx.send(Err(status.clone()));
        }
        failed
    }

    fn finish_query(&self) {
        self.state.lock().outstanding_query = false;
        self.query_done.notify_waiters();
    }

    async fn wait_for_outstanding_query(&self) {
        loop {
            let notified = self.query_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.state.lock().outstanding_query;
            if !outstanding {
                return;
            }
            notified.await;
        }
    }
}
