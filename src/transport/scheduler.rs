//! Deferred execution for retry delays.
//!
//! Each engine owns its own scheduler so teardown is clean: `close`
//! cancels every pending task and waits for them to finish before it
//! drains the callback queue, which is how deferred retries surface as
//! cancelled instead of silently disappearing. Nothing here is
//! process-global.

use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct SchedulerInner {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SchedulerInner {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }
}

/// Per-engine deferred-task runner.
pub(crate) struct Scheduler {
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::new()),
        }
    }

    /// Run `task` after `delay`. The argument tells the task whether the
    /// delay elapsed (`true`) or the scheduler was shut down first
    /// (`false`); either way the task runs exactly once.
    pub(crate) fn defer<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let (tracker, token) = {
            let inner = self.inner.lock();
            (inner.tracker.clone(), inner.token.clone())
        };

        tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task(true),
                _ = token.cancelled() => task(false),
            }
        });
    }

    /// Sleep for `delay`, returning `false` if the scheduler was shut
    /// down before the delay elapsed.
    pub(crate) async fn sleep(&self, delay: Duration) -> bool {
        let token = self.inner.lock().token.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.cancelled() => false,
        }
    }

    /// Cancel all pending tasks and wait for them to finish. The
    /// scheduler is immediately usable again afterwards.
    pub(crate) async fn shutdown(&self) {
        let old = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut *inner, SchedulerInner::new())
        };

        old.token.cancel();
        old.tracker.close();
        old.tracker.wait().await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
