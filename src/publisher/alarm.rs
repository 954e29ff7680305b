//! Periodic callbacks with race-free cancellation.
//!
//! Each alarm runs as one task on the shared executor: sleep for the period,
//! then invoke the callback under the alarm's mutex, then repeat. A
//! [`CancelToken`] owns the registration. Dropping it takes the callback out
//! of the slot under that same mutex:
//!
//! - if no firing is in progress, the next wakeup finds the slot empty and exits;
//! - if a firing is in progress, the drop blocks until the callback returns.
//!
//! Either way no callback runs after `drop` returns, which is what lets
//! owners tear down state the callback touches right after cancelling.
//!
//! A callback must not drop its own token; that would deadlock on the slot.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use super::traits::{TimerService, TokioTimer};

type Callback = Box<dyn FnMut() + Send>;

/// Registers periodic alarms on a shared executor.
#[derive(Clone)]
pub struct AlarmRegistry {
    handle: Handle,
    timer: Arc<dyn TimerService>,
}

impl AlarmRegistry {
    /// Create a registry using the tokio timer.
    pub fn new(handle: Handle) -> Self {
        Self::with_timer(handle, Arc::new(TokioTimer))
    }

    /// Create a registry using a custom timer.
    pub fn with_timer(handle: Handle, timer: Arc<dyn TimerService>) -> Self {
        Self { handle, timer }
    }

    /// Invoke `callback` every `period` until the returned token is dropped.
    ///
    /// The first invocation happens one `period` after registration, never
    /// from within this call. Invocations never overlap. If the timer fails
    /// the alarm stops silently.
    pub fn register_alarm<F>(&self, period: Duration, callback: F) -> CancelToken
    where
        F: FnMut() + Send + 'static,
    {
        let slot: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(callback))));
        let firing = slot.clone();
        let timer = self.timer.clone();

        let task = self.handle.spawn(async move {
            loop {
                if let Err(e) = timer.sleep(period).await {
                    debug!(error = %e, "Alarm timer failed, stopping alarm");
                    return;
                }

                let fired = {
                    let mut guard = firing.lock();
                    match guard.as_mut() {
                        Some(callback) => {
                            callback();
                            true
                        }
                        None => false,
                    }
                };

                if !fired {
                    return;
                }
            }
        });

        CancelToken {
            slot,
            task: Some(task),
        }
    }
}

impl fmt::Debug for AlarmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmRegistry").finish_non_exhaustive()
    }
}

/// Handle to a registered alarm. Dropping it cancels the alarm.
#[must_use = "dropping the token cancels the alarm"]
pub struct CancelToken {
    slot: Arc<Mutex<Option<Callback>>>,
    task: Option<JoinHandle<()>>,
}

impl CancelToken {
    /// Returns true while the alarm can still fire.
    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Drop for CancelToken {
    fn drop(&mut self) {
        // Blocks while a firing holds the slot.
        let callback = self.slot.lock().take();
        drop(callback);

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("active", &self.is_active())
            .finish()
    }
}
