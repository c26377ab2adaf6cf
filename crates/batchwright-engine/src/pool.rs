//! A bounded pool of workers for remote calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::warn;

/// A pool running at most a fixed number of tasks at a time.
///
/// Tasks beyond the limit wait for a permit. Shutting the pool down stops it
/// from accepting tasks, waits for the running ones for a grace period and
/// then cancels whatever is left.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// The permits bounding concurrency.
    permits: Arc<Semaphore>,
    /// Tracks the spawned tasks.
    tracker: TaskTracker,
    /// Cancels the spawned tasks.
    token: CancellationToken,
    /// The runtime tasks are spawned on.
    runtime: Handle,
    /// How long shutdown waits before cancelling.
    grace: Duration,
}

impl WorkerPool {
    /// Constructs a pool with the given number of workers.
    ///
    /// The pool's tasks are cancelled when `token` is.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(workers: usize, grace: Duration, token: &CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
            token: token.child_token(),
            runtime: Handle::current(),
            grace,
        }
    }

    /// Determines if the pool no longer accepts tasks.
    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed() || self.token.is_cancelled()
    }

    /// Spawns a task on the pool.
    ///
    /// The task resolves to `None` if it was cancelled before completing.
    /// Returns `None` if the pool no longer accepts tasks.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<Option<F::Output>>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return None;
        }

        let permits = self.permits.clone();
        let token = self.token.clone();
        Some(self.tracker.spawn_on(
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return None,
                    permit = permits.acquire_owned() => permit.ok()?,
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    output = future => Some(output),
                }
            },
            &self.runtime,
        ))
    }

    /// Shuts down the pool.
    ///
    /// Waits up to the grace period for running tasks before cancelling
    /// them.
    pub async fn shutdown(&self) {
        self.tracker.close();
        debug!(tasks = self.tracker.len(), "shutting down worker pool");

        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                tasks = self.tracker.len(),
                "worker pool did not drain in time; cancelling remaining tasks"
            );
            self.token.cancel();
            self.tracker.wait().await;
        }

        self.permits.close();
    }
}
