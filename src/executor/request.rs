//! Execution requests and the handle that controls them.

use crate::backend::Strategy;
use crate::error::{Result, TaskmuxError};
use crate::task::{Task, TaskId};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Request built, not yet running.
    Pending,
    /// Tasks are being dispatched and collected.
    Running,
    /// Every task produced an outcome.
    Completed,
    /// The deadline passed with outcomes missing.
    Partial,
    /// The batch was cancelled with outcomes missing.
    Aborted,
}

impl ExecutionState {
    /// Returns true for the three end states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Aborted)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Cancels and observes one execution.
///
/// Obtained from [`ExecutionRequest::handle`] before the request is
/// executed; clones refer to the same execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: Uuid,
    token: CancellationToken,
    state: watch::Receiver<ExecutionState>,
}

impl ExecutionHandle {
    /// Returns the execution id used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Aborts the execution, best effort.
    ///
    /// Tasks not yet started end CANCELLED without running. Running tasks
    /// see their cancellation token fire. Safe to call before the request
    /// is executed, in which case nothing runs at all.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Waits until the execution reaches `state` or a terminal state.
    ///
    /// Returns the state observed. A request dropped without being executed
    /// reads as [`ExecutionState::Pending`].
    pub async fn wait_for(&self, state: ExecutionState) -> ExecutionState {
        let mut rx = self.state.clone();
        let result = rx.wait_for(|s| *s == state || s.is_terminal()).await;
        result.map_or_else(|_| *self.state.borrow(), |s| *s)
    }
}

/// Channel ends shared between a request and its handles.
pub(crate) struct Control {
    pub(crate) id: Uuid,
    pub(crate) token: CancellationToken,
    pub(crate) state: watch::Sender<ExecutionState>,
}

impl Control {
    fn new() -> Self {
        let (state, _) = watch::channel(ExecutionState::Pending);
        Self {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
            state,
        }
    }

    pub(crate) fn set(&self, state: ExecutionState) {
        self.state.send_replace(state);
    }
}

/// A validated batch of tasks plus how to run it.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use taskmux::executor::ExecutionRequest;
/// use taskmux::{Strategy, Task};
///
/// let request = ExecutionRequest::builder()
///     .task(Task::builder().id("a").job("echo", json!(1)).build()?)
///     .task(Task::builder().id("b").job("echo", json!(2)).build()?)
///     .strategy(Strategy::Cooperative)
///     .max_concurrency(2)
///     .timeout(Duration::from_secs(5))
///     .build()?;
///
/// assert_eq!(request.len(), 2);
/// # Ok::<(), taskmux::error::TaskmuxError>(())
/// ```
pub struct ExecutionRequest {
    pub(crate) tasks: Vec<Task>,
    pub(crate) strategy: Strategy,
    pub(crate) max_concurrency: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) control: Control,
}

impl ExecutionRequest {
    /// Creates a new request builder.
    #[must_use]
    pub fn builder() -> ExecutionRequestBuilder {
        ExecutionRequestBuilder::default()
    }

    /// Returns the tasks in submission order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Returns the number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the request holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the strategy.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the concurrency bound.
    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns the batch timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns a handle for cancelling and observing this request.
    #[must_use]
    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            id: self.control.id,
            token: self.control.token.clone(),
            state: self.control.state.subscribe(),
        }
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("id", &self.control.id)
            .field("tasks", &self.tasks.len())
            .field("strategy", &self.strategy)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`ExecutionRequest`].
#[derive(Default)]
pub struct ExecutionRequestBuilder {
    tasks: Vec<Task>,
    strategy: Option<Strategy>,
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl ExecutionRequestBuilder {
    /// Appends one task.
    #[must_use]
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Appends several tasks.
    #[must_use]
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Sets the strategy (default: thread).
    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the concurrency bound (default: number of CPUs).
    #[must_use]
    pub const fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Sets a deadline for the whole batch.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no tasks, two tasks share an id, or
    /// `max_concurrency` is zero.
    pub fn build(self) -> Result<ExecutionRequest> {
        if self.tasks.is_empty() {
            return Err(TaskmuxError::EmptyBatch);
        }

        let max_concurrency = self.max_concurrency.unwrap_or_else(num_cpus::get);
        if max_concurrency == 0 {
            return Err(TaskmuxError::InvalidConcurrency {
                value: max_concurrency,
            });
        }

        let mut seen: HashSet<&TaskId> = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !seen.insert(task.id()) {
                return Err(TaskmuxError::DuplicateTaskId {
                    task_id: task.id().clone(),
                });
            }
        }

        Ok(ExecutionRequest {
            tasks: self.tasks,
            strategy: self.strategy.unwrap_or(Strategy::Thread),
            max_concurrency,
            timeout: self.timeout,
            control: Control::new(),
        })
    }
}
