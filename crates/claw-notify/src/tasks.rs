//! Supervised background tasks.
//!
//! A [`TaskGroup`] ties a set of tasks to one [`CancellationToken`]. Any task
//! returning an error or panicking cancels the group, and the first such
//! error is kept for [`TaskGroup::wait`].

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::{BrokerError, Result};

/// A cancellable group of tasks with stop and wait semantics.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<Mutex<Option<BrokerError>>>,
}

impl TaskGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The group's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once stop has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns a supervised task.
    ///
    /// An error or panic in the task is recorded and cancels the group.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);
        let inner = tokio::spawn(task);

        self.tracker.spawn(async move {
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(join) => Err(BrokerError::Task(format!("{name}: {join}"))),
            };

            match outcome {
                Ok(()) => debug!(task = name, "task finished"),
                Err(e) => {
                    error!(task = name, error = %e, "task failed");
                    first_error.lock().get_or_insert(e);
                    token.cancel();
                }
            }
        })
    }

    /// Requests cancellation of every task in the group.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for every task to finish and returns the first error, if any.
    ///
    /// The error is handed out once; later calls return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a task.
    pub async fn wait(&self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;
        self.first_error.lock().take().map_or(Ok(()), Err)
    }
}
