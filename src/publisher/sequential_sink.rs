//! At-most-one-in-flight publishing over a batch sink.
//!
//! [`SequentialBatchSink`] wraps a [`BatchSink`] so that requests are sent
//! strictly one after another in submission order. The i-th request's result
//! is observed before the (i+1)-th is dispatched.
//!
//! # States
//!
//! ```text
//!  Clear ──dispatch──▶ InFlight ──success, queue empty──▶ Clear
//!                         │  ▲
//!                         │  └──success, queue non-empty (dispatch next)
//!                         └──failure──▶ Corked(error) ──resume_publish──▶ Clear
//! ```
//!
//! Once corked, every queued request and every new request fails with the
//! corking error without reaching the child. Nothing is replayed on resume;
//! callers resubmit.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::receive_result;
use super::traits::BatchSink;
use crate::error::{Error, Result};

/// Cork state of the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorkState {
    /// Nothing in flight.
    Clear,
    /// One request is being published.
    InFlight,
    /// A request failed; everything fails fast until resumed.
    Corked(Error),
}

struct QueuedRequest<S: BatchSink> {
    request: S::Request,
    tx: oneshot::Sender<Result<S::Response>>,
}

struct SinkState<S: BatchSink> {
    cork: CorkState,
    queue: VecDeque<QueuedRequest<S>>,
}

struct SinkInner<S: BatchSink> {
    child: Arc<S>,
    handle: Handle,
    state: Mutex<SinkState<S>>,
}

/// Serializes publish requests to a child [`BatchSink`].
pub struct SequentialBatchSink<S: BatchSink + 'static> {
    inner: Arc<SinkInner<S>>,
}

impl<S: BatchSink + 'static> SequentialBatchSink<S> {
    /// Wrap `child`, dispatching its calls on `handle`.
    pub fn new(child: Arc<S>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                child,
                handle,
                state: Mutex::new(SinkState {
                    cork: CorkState::Clear,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Publish `request` after every previously submitted request.
    ///
    /// Fails immediately with the corking error if the sink is corked.
    pub fn async_publish(&self, request: S::Request) -> BoxFuture<'static, Result<S::Response>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            match &state.cork {
                CorkState::Corked(error) => return future::ready(Err(error.clone())).boxed(),
                CorkState::InFlight => {
                    state.queue.push_back(QueuedRequest { request, tx });
                    return receive_result(rx);
                }
                CorkState::Clear => state.cork = CorkState::InFlight,
            }
        }

        self.inner.clone().dispatch(request, tx);
        receive_result(rx)
    }

    /// Clear the cork and forward the resume signal to the child.
    ///
    /// Requests that failed while corked are not replayed.
    pub fn resume_publish(&self, ordering_key: &str) {
        {
            let mut state = self.inner.state.lock();
            if matches!(state.cork, CorkState::Corked(_)) {
                debug!(ordering_key, "Resuming corked batch sink");
                state.cork = CorkState::Clear;
            }
        }
        self.inner.child.resume_publish(ordering_key);
    }

    /// Number of requests waiting behind the in-flight one.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Current cork state.
    pub fn cork_state(&self) -> CorkState {
        self.inner.state.lock().cork.clone()
    }
}

impl<S: BatchSink + 'static> Clone for SequentialBatchSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: BatchSink + 'static> SinkInner<S> {
    /// Send `request` to the child. The caller has already set `InFlight`.
    fn dispatch(self: Arc<Self>, request: S::Request, tx: oneshot::Sender<Result<S::Response>>) {
        let handle = self.handle.clone();
        handle.spawn(async move {
            let result = self.child.publish(request).await;
            // Settle the state machine before the caller can observe the result.
            self.on_complete(result.as_ref().err().cloned());
            let _ = tx.send(result);
        });
    }

    fn on_complete(self: &Arc<Self>, failure: Option<Error>) {
        match failure {
            Some(error) => {
                let queued = {
                    let mut state = self.state.lock();
                    state.cork = CorkState::Corked(error.clone());
                    std::mem::take(&mut state.queue)
                };
                if !queued.is_empty() {
                    warn!(
                        error = %error,
                        failed_requests = queued.len(),
                        "Batch publish failed, failing queued requests"
                    );
                }
                for pending in queued {
                    let _ = pending.tx.send(Err(error.clone()));
                }
            }
            None => {
                let next = {
                    let mut state = self.state.lock();
                    let next = state.queue.pop_front();
                    if next.is_none() {
                        state.cork = CorkState::Clear;
                    }
                    next
                };
                if let Some(next) = next {
                    self.clone().dispatch(next.request, next.tx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::mock::MockBatchSink;

    #[tokio::test]
    async fn test_single_request_returns_to_clear() {
        let child = Arc::new(MockBatchSink::<u32, u32>::with_responder(|r| Ok(r * 2)));
        let sink = SequentialBatchSink::new(child.clone(), Handle::current());

        assert_eq!(sink.async_publish(21).await.unwrap(), 42);
        assert_eq!(sink.cork_state(), CorkState::Clear);
        assert_eq!(sink.queue_depth(), 0);
        assert_eq!(child.requests(), vec![21]);
    }

    #[tokio::test]
    async fn test_responses_preserve_submission_order() {
        let child = Arc::new(MockBatchSink::<u32, u32>::with_responder(|r| Ok(*r)));
        let sink = SequentialBatchSink::new(child.clone(), Handle::current());

        let futures: Vec<_> = (0..10).map(|i| sink.async_publish(i)).collect();
        let results = futures::future::join_all(futures).await;

        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert_eq!(child.requests(), (0..10).collect::<Vec<_>>());
    }
}
