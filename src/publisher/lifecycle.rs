//! Lifecycle aggregation across child services.
//!
//! [`LifecycleAggregator`] composes start/shutdown/abort for a dynamic set of
//! children. It only holds [`Weak`] references: whoever adds a child keeps
//! ownership of it, and the aggregator never extends a child's lifetime.
//!
//! The aggregate terminates exactly once, with the first of:
//! - an explicit [`abort`](LifecycleAggregator::abort),
//! - any child's `start()` future resolving with an error,
//! - [`shutdown`](LifecycleAggregator::shutdown), which installs [`Error::Shutdown`].
//!
//! After termination [`status`](LifecycleAggregator::status) reports the
//! terminal error, which publishers use to fail new work fast.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::receive_result;
use super::traits::LifecycleService;
use crate::error::{Error, Result};

struct AggregatorState {
    services: Vec<Weak<dyn LifecycleService>>,
    started: bool,
    shut_down: bool,
    status: Option<Error>,
    completion: Option<oneshot::Sender<Result<()>>>,
}

struct AggregatorInner {
    handle: Handle,
    state: Mutex<AggregatorState>,
}

/// Composes the lifecycle of a set of child services.
#[derive(Clone)]
pub struct LifecycleAggregator {
    inner: Arc<AggregatorInner>,
}

/// Map a terminal status onto the result of `start()`.
fn terminal_result(status: &Error) -> Result<()> {
    if status.is_shutdown() {
        Ok(())
    } else {
        Err(status.clone())
    }
}

impl LifecycleAggregator {
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                handle,
                state: Mutex::new(AggregatorState {
                    services: Vec::new(),
                    started: false,
                    shut_down: false,
                    status: None,
                    completion: None,
                }),
            }),
        }
    }

    /// Add a child. Started right away if the aggregate is already running.
    ///
    /// Returns false, without registering the child, once the aggregate has
    /// terminated. The caller then owns the child's shutdown.
    pub fn add_service(&self, service: Weak<dyn LifecycleService>) -> bool {
        let start_now = {
            let mut state = self.inner.state.lock();
            if let Some(status) = &state.status {
                debug!(status = %status, "Rejecting service added after termination");
                return false;
            }
            state.services.push(service.clone());
            state.started
        };

        if start_now {
            if let Some(service) = service.upgrade() {
                self.watch(service.start());
            }
        }
        true
    }

    /// Start every known child.
    ///
    /// Resolves when the aggregate terminates: `Ok(())` after `shutdown`,
    /// the abort status otherwise.
    pub fn start(&self) -> BoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let services: Vec<_> = {
            let mut state = self.inner.state.lock();
            if let Some(status) = &state.status {
                return future::ready(terminal_result(status)).boxed();
            }
            if state.started {
                return future::ready(Err(Error::FailedPrecondition(
                    "start() called more than once".to_string(),
                )))
                .boxed();
            }
            state.started = true;
            state.completion = Some(tx);
            state.services.iter().filter_map(|service| service.upgrade()).collect()
        };

        debug!(services = services.len(), "Starting lifecycle aggregate");
        for service in services {
            self.watch(service.start());
        }
        receive_result(rx)
    }

    /// Terminate the aggregate with `status`. The first terminal status wins.
    pub fn abort(&self, status: Error) {
        let completion = {
            let mut state = self.inner.state.lock();
            if state.status.is_some() {
                return;
            }
            state.status = Some(status.clone());
            state.completion.take()
        };

        error!(status = %status, "Publisher aborted");
        if let Some(tx) = completion {
            let _ = tx.send(Err(status));
        }
    }

    /// Terminate the aggregate and shut down every child.
    ///
    /// The returned future resolves once every child's shutdown completed.
    pub fn shutdown(&self) -> BoxFuture<'static, ()> {
        let (services, completion): (Vec<_>, _) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return future::ready(()).boxed();
            }
            state.shut_down = true;
            if state.status.is_none() {
                state.status = Some(Error::Shutdown);
            }
            (
                state.services.iter().filter_map(|service| service.upgrade()).collect(),
                state.completion.take(),
            )
        };

        info!(services = services.len(), "Shutting down lifecycle aggregate");
        if let Some(tx) = completion {
            let _ = tx.send(Ok(()));
        }

        let shutdowns: Vec<_> = services.iter().map(|service| service.shutdown()).collect();
        async move {
            future::join_all(shutdowns).await;
        }
        .boxed()
    }

    /// The terminal status, or `None` while running.
    pub fn status(&self) -> Option<Error> {
        self.inner.state.lock().status.clone()
    }

    /// Number of registered children.
    pub fn service_count(&self) -> usize {
        self.inner.state.lock().services.len()
    }

    /// Abort the aggregate if a child terminates with an error.
    fn watch(&self, started: BoxFuture<'static, Result<()>>) {
        let aggregator = self.clone();
        self.inner.handle.spawn(async move {
            if let Err(e) = started.await {
                aggregator.abort(e);
            }
        });
    }
}
