//! In-memory mocks for testing.
//!
//! These implement the collaborator traits of the publish path without any
//! transport, and expose knobs to hold, fail, and inspect calls.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! partlog = { path = ".", features = ["test-utilities"] }
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, oneshot, watch};

use super::receive_result;
use super::traits::{AdminConnection, BatchSink, LifecycleService, PartitionPublisher};
use crate::error::{Error, Result};
use crate::types::{Message, Offset, Partition, TopicPath};

// ============================================================================
// Admin connection
// ============================================================================

/// Admin connection answering partition-count queries from memory.
///
/// Queries can be paused to model a slow control plane: a paused query reads
/// its response only after [`resume`](MockAdminConnection::resume).
pub struct MockAdminConnection {
    response: Mutex<Result<u32>>,
    calls: AtomicUsize,
    paused: watch::Sender<bool>,
}

impl MockAdminConnection {
    pub fn new(partition_count: u32) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            response: Mutex::new(Ok(partition_count)),
            calls: AtomicUsize::new(0),
            paused,
        }
    }

    /// Answer subsequent queries with `partition_count`.
    pub fn set_partition_count(&self, partition_count: u32) {
        *self.response.lock() = Ok(partition_count);
    }

    /// Fail subsequent queries with `error`.
    pub fn set_error(&self, error: Error) {
        *self.response.lock() = Err(error);
    }

    /// Hold queries until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Number of queries received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdminConnection for MockAdminConnection {
    async fn get_topic_partitions(&self, _topic: &TopicPath) -> Result<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
        self.response.lock().clone()
    }
}

// ============================================================================
// Partition publisher
// ============================================================================

#[derive(Default)]
struct MockPublisherState {
    started: bool,
    shut_down: bool,
    hold_publishes: bool,
    flushes: usize,
    next_offset: i64,
    published: Vec<Message>,
    held: Vec<(Offset, oneshot::Sender<Result<Offset>>)>,
    failure: Option<Error>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

/// Partition publisher that records messages and assigns sequential offsets.
///
/// By default publishes resolve immediately. With
/// [`hold_publishes`](MockPartitionPublisher::hold_publishes) they stay
/// outstanding until [`release`](MockPartitionPublisher::release) or shutdown.
pub struct MockPartitionPublisher {
    partition: Partition,
    state: Mutex<MockPublisherState>,
}

impl MockPartitionPublisher {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            state: Mutex::new(MockPublisherState::default()),
        }
    }

    /// Keep publish results outstanding until released.
    pub fn hold_publishes(&self) {
        self.state.lock().hold_publishes = true;
    }

    /// Resolve every held publish with its offset.
    pub fn release(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for (offset, tx) in held {
            let _ = tx.send(Ok(offset));
        }
    }

    /// Fail permanently: the start future resolves with `error` and later
    /// publishes fail with it.
    pub fn fail(&self, error: Error) {
        let completion = {
            let mut state = self.state.lock();
            state.failure = Some(error.clone());
            state.completion.take()
        };
        if let Some(tx) = completion {
            let _ = tx.send(Err(error));
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<Message> {
        self.state.lock().published.clone()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }
}

impl LifecycleService for MockPartitionPublisher {
    fn start(&self) -> BoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.started = true;
        if let Some(error) = &state.failure {
            return future::ready(Err(error.clone())).boxed();
        }
        state.completion = Some(tx);
        receive_result(rx)
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let (held, completion) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            (std::mem::take(&mut state.held), state.completion.take())
        };
        for (_, tx) in held {
            let _ = tx.send(Err(Error::Shutdown));
        }
        if let Some(tx) = completion {
            let _ = tx.send(Ok(()));
        }
        future::ready(()).boxed()
    }
}

impl PartitionPublisher for MockPartitionPublisher {
    fn publish(&self, message: Message) -> BoxFuture<'static, Result<Offset>> {
        let mut state = self.state.lock();
        if let Some(error) = &state.failure {
            return future::ready(Err(error.clone())).boxed();
        }
        if state.shut_down {
            return future::ready(Err(Error::Shutdown)).boxed();
        }

        let offset = Offset(state.next_offset);
        state.next_offset += 1;
        state.published.push(message);

        if state.hold_publishes {
            let (tx, rx) = oneshot::channel();
            state.held.push((offset, tx));
            receive_result(rx)
        } else {
            future::ready(Ok(offset)).boxed()
        }
    }

    fn flush(&self) {
        self.state.lock().flushes += 1;
    }
}

// ============================================================================
// Batch sink
// ============================================================================

type Responder<Req, Resp> = Box<dyn Fn(&Req) -> Result<Resp> + Send + Sync>;

struct MockSinkState<Req, Resp> {
    requests: Vec<Req>,
    outstanding: VecDeque<oneshot::Sender<Result<Resp>>>,
    resumed: Vec<String>,
}

/// Batch sink that records requests.
///
/// A sink built with [`new`](MockBatchSink::new) keeps every request
/// outstanding until the test resolves it with
/// [`complete_next`](MockBatchSink::complete_next). A sink built with
/// [`with_responder`](MockBatchSink::with_responder) answers immediately.
pub struct MockBatchSink<Req, Resp> {
    responder: Option<Responder<Req, Resp>>,
    state: Mutex<MockSinkState<Req, Resp>>,
    arrived: Notify,
}

impl<Req, Resp> MockBatchSink<Req, Resp> {
    pub fn new() -> Self {
        Self {
            responder: None,
            state: Mutex::new(MockSinkState {
                requests: Vec::new(),
                outstanding: VecDeque::new(),
                resumed: Vec::new(),
            }),
            arrived: Notify::new(),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Req) -> Result<Resp> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Resolve the oldest outstanding request. Returns false if none was outstanding.
    pub fn complete_next(&self, result: Result<Resp>) -> bool {
        let next = self.state.lock().outstanding.pop_front();
        match next {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Requests received but not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Total requests received.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Ordering keys passed to `resume_publish`.
    pub fn resumed_keys(&self) -> Vec<String> {
        self.state.lock().resumed.clone()
    }

    /// Wait until at least `count` requests have been received.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.request_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl<Req: Clone, Resp> MockBatchSink<Req, Resp> {
    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Req> {
        self.state.lock().requests.clone()
    }
}

impl<Req, Resp> Default for MockBatchSink<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Req, Resp> BatchSink for MockBatchSink<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    async fn publish(&self, request: Req) -> Result<Resp> {
        if let Some(responder) = &self.responder {
            let result = responder(&request);
            self.state.lock().requests.push(request);
            self.arrived.notify_waiters();
            return result;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.requests.push(request);
            state.outstanding.push_back(tx);
        }
        self.arrived.notify_waiters();
        receive_result(rx).await
    }

    fn resume_publish(&self, ordering_key: &str) {
        self.state.lock().resumed.push(ordering_key.to_string());
    }
}
