//! Batching publisher for a single partition.
//!
//! Messages are buffered and sent as a [`MessageBatch`] when the batch would
//! exceed its message or byte threshold, when [`flush`](PartitionPublisher::flush)
//! is called, or when the delay alarm fires. Batches go through a
//! [`SequentialBatchSink`], so at most one is in flight and they complete in
//! order. The sink answers a batch with the offset of its first message;
//! message `i` of the batch is assigned `start + i`.
//!
//! A failed batch is a permanent failure for the partition: its messages and
//! every buffered or later message fail with the same error, and the
//! publisher's `start()` future resolves with it.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, trace};

use super::alarm::{AlarmRegistry, CancelToken};
use super::config::BatchingSettings;
use super::multipartition::PartitionPublisherFactory;
use super::receive_result;
use super::sequential_sink::SequentialBatchSink;
use super::traits::{BatchSink, LifecycleService, PartitionPublisher};
use crate::error::{Error, Result};
use crate::types::{Message, Offset, Partition};

/// One publish request: messages for a single partition, in publish order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub partition: Partition,
    pub messages: Vec<Message>,
}

struct BufferedMessage {
    message: Message,
    tx: oneshot::Sender<Result<Offset>>,
}

struct BatcherState {
    buffer: Vec<BufferedMessage>,
    buffered_bytes: usize,
    in_flight: usize,
    started: bool,
    status: Option<Error>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

struct BatcherInner<S: BatchSink<Request = MessageBatch, Response = Offset> + 'static> {
    partition: Partition,
    settings: BatchingSettings,
    sink: SequentialBatchSink<S>,
    handle: Handle,
    state: Mutex<BatcherState>,
    idle: Notify,
}

/// [`PartitionPublisher`] that batches messages over a [`BatchSink`].
pub struct BatchingPartitionPublisher<S>
where
    S: BatchSink<Request = MessageBatch, Response = Offset> + 'static,
{
    flush_alarm: Mutex<Option<CancelToken>>,
    alarms: AlarmRegistry,
    inner: Arc<BatcherInner<S>>,
}

impl<S> BatchingPartitionPublisher<S>
where
    S: BatchSink<Request = MessageBatch, Response = Offset> + 'static,
{
    pub fn new(
        partition: Partition,
        sink: Arc<S>,
        settings: BatchingSettings,
        alarms: AlarmRegistry,
        handle: Handle,
    ) -> Self {
        Self {
            flush_alarm: Mutex::new(None),
            alarms,
            inner: Arc::new(BatcherInner {
                partition,
                settings,
                sink: SequentialBatchSink::new(sink, handle.clone()),
                handle,
                state: Mutex::new(BatcherState {
                    buffer: Vec::new(),
                    buffered_bytes: 0,
                    in_flight: 0,
                    started: false,
                    status: None,
                    completion: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// A factory for [`MultipartitionPublisher`](super::MultipartitionPublisher)
    /// that builds one batching publisher per partition over the sink
    /// returned by `sink_for`.
    pub fn factory<F>(
        sink_for: F,
        settings: BatchingSettings,
        alarms: AlarmRegistry,
        handle: Handle,
    ) -> PartitionPublisherFactory<Self>
    where
        F: Fn(Partition) -> Arc<S> + Send + Sync + 'static,
    {
        Box::new(move |partition| {
            Arc::new(Self::new(
                partition,
                sink_for(partition),
                settings.clone(),
                alarms.clone(),
                handle.clone(),
            ))
        })
    }

    pub fn partition(&self) -> Partition {
        self.inner.partition
    }

    /// Messages buffered and not yet sent.
    pub fn buffered_count(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }
}

impl<S> LifecycleService for BatchingPartitionPublisher<S>
where
    S: BatchSink<Request = MessageBatch, Response = Offset> + 'static,
{
    fn start(&self) -> BoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if let Some(status) = &state.status {
                let result = if status.is_shutdown() {
                    Ok(())
                } else {
                    Err(status.clone())
                };
                return future::ready(result).boxed();
            }
            if state.started {
                return future::ready(Err(Error::FailedPrecondition(
                    "start() called more than once".to_string(),
                )))
                .boxed();
            }
            state.started = true;
            state.completion = Some(tx);
        }

        let weak: Weak<BatcherInner<S>> = Arc::downgrade(&self.inner);
        let token = self
            .alarms
            .register_alarm(self.inner.settings.max_delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            });
        *self.flush_alarm.lock() = Some(token);

        debug!(partition = %self.inner.partition, "Partition publisher started");
        receive_result(rx)
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let token = self.flush_alarm.lock().take();
        drop(token);

        let completion = {
            let mut state = self.inner.state.lock();
            self.inner.send_batch(&mut state);
            if state.status.is_none() {
                state.status = Some(Error::Shutdown);
            }
            state.completion.take()
        };
        if let Some(tx) = completion {
            let _ = tx.send(Ok(()));
        }

        let inner = self.inner.clone();
        async move {
            inner.wait_idle().await;
            debug!(partition = %inner.partition, "Partition publisher shut down");
        }
        .boxed()
    }
}

impl<S> PartitionPublisher for BatchingPartitionPublisher<S>
where
    S: BatchSink<Request = MessageBatch, Response = Offset> + 'static,
{
    fn publish(&self, message: Message) -> BoxFuture<'static, Result<Offset>> {
        let (tx, rx) = oneshot::channel();
        let size = message.encoded_len();
        let settings = &self.inner.settings;

        let mut state = self.inner.state.lock();
        if let Some(status) = &state.status {
            return future::ready(Err(status.clone())).boxed();
        }

        // Send what we have if this message would push the batch over its byte limit.
        if !state.buffer.is_empty() && state.buffered_bytes + size > settings.max_bytes {
            self.inner.send_batch(&mut state);
        }

        state.buffer.push(BufferedMessage { message, tx });
        state.buffered_bytes += size;

        if state.buffer.len() >= settings.max_messages || state.buffered_bytes >= settings.max_bytes
        {
            self.inner.send_batch(&mut state);
        }
        drop(state);

        receive_result(rx)
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

impl<S> BatcherInner<S>
where
    S: BatchSink<Request = MessageBatch, Response = Offset> + 'static,
{
    fn flush(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.send_batch(&mut state);
    }

    /// Send the buffer as one batch.
    ///
    /// Called with the state lock held so batches reach the sink in the order
    /// they were cut. The sink only takes its own lock and spawns the request.
    fn send_batch(self: &Arc<Self>, state: &mut BatcherState) {
        if state.buffer.is_empty() {
            return;
        }

        let buffered = std::mem::take(&mut state.buffer);
        state.buffered_bytes = 0;
        state.in_flight += 1;

        let (messages, senders): (Vec<_>, Vec<_>) = buffered
            .into_iter()
            .map(|buffered| (buffered.message, buffered.tx))
            .unzip();
        trace!(
            partition = %self.partition,
            messages = messages.len(),
            "Sending batch"
        );

        let published = self.sink.async_publish(MessageBatch {
            partition: self.partition,
            messages,
        });

        let inner = self.clone();
        self.handle.spawn(async move {
            match published.await.and_then(|start| batch_offsets(start, senders.len())) {
                Ok(offsets) => {
                    for (offset, tx) in offsets.into_iter().zip(senders) {
                        let _ = tx.send(Ok(offset));
                    }
                }
                Err(e) => {
                    for tx in senders {
                        let _ = tx.send(Err(e.clone()));
                    }
                    inner.abort(e);
                }
            }
            inner.batch_done();
        });
    }

    /// Fail the publisher permanently with `status`.
    fn abort(&self, status: Error) {
        let (buffered, completion) = {
            let mut state = self.state.lock();
            if state.status.is_some() {
                return;
            }
            state.status = Some(status.clone());
            state.buffered_bytes = 0;
            (std::mem::take(&mut state.buffer), state.completion.take())
        };

        error!(partition = %self.partition, error = %status, "Partition publisher failed");
        for message in buffered {
            let _ = message.tx.send(Err(status.clone()));
        }
        if let Some(tx) = completion {
            let _ = tx.send(Err(status));
        }
    }

    fn batch_done(&self) {
        self.state.lock().in_flight -= 1;
        self.idle.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight = self.state.lock().in_flight;
            if in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Offsets of a `count`-message batch whose first message landed at `start`.
fn batch_offsets(start: Offset, count: usize) -> Result<Vec<Offset>> {
    (0..count as i64)
        .map(|index| {
            start.checked_advance(index).ok_or_else(|| {
                Error::Internal(format!(
                    "offset overflow: batch of {count} messages starting at {start}"
                ))
            })
        })
        .collect()
}
