//! Per-task execution context.

use crate::error::TaskError;
use crate::task::TaskId;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle passed into every payload.
///
/// All waiting a payload does should go through this context: the wait
/// primitives return [`TaskError::Cancelled`] as soon as the task is cancelled.
/// On the thread and process backends they park the task's dedicated worker;
/// on the cooperative backend they hand control back to the scheduler.
///
/// A payload that blocks its thread with `std::thread::sleep` or synchronous
/// I/O still runs correctly, but on the cooperative backend it stalls every
/// other task in the batch, and it never observes cancellation until it
/// reaches [`checkpoint`](Self::checkpoint).
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) const fn new(task_id: TaskId, token: CancellationToken) -> Self {
        Self { task_id, token }
    }

    /// Creates a context that is only cancelled through its own token.
    ///
    /// Used by worker processes and for driving payloads outside an executor.
    #[must_use]
    pub fn detached(task_id: TaskId) -> Self {
        Self::new(task_id, CancellationToken::new())
    }

    /// Returns the id of the running task.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Checked suspension point for code that does not otherwise await.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] if the task was cancelled.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps without blocking the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] if the task is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        self.suspend(tokio::time::sleep(duration)).await
    }

    /// Awaits `future` unless the task is cancelled first.
    ///
    /// Wrap calls to external services (an HTTP client, a database) in this
    /// so they stop when the batch is aborted or times out.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] if the task is cancelled first.
    pub async fn suspend<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(TaskError::Cancelled),
            output = future => Ok(output),
        }
    }

    /// Yields to the scheduler once.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cancelled`] if the task was cancelled.
    pub async fn yield_now(&self) -> Result<(), TaskError> {
        self.checkpoint()?;
        tokio::task::yield_now().await;
        self.checkpoint()
    }

    /// Token for nested concurrent work started by the payload.
    ///
    /// It is cancelled together with the task; cancelling it does not
    /// cancel the task.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Requests cancellation of this task.
    #[cfg(test)]
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}
