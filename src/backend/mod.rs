//! Execution backends for taskmux.
//!
//! This module defines the [`Backend`] trait and the three substrates that
//! implement it: a thread pool, a pool of worker processes, and a
//! single-threaded cooperative scheduler. The executor picks one per batch
//! from a [`Strategy`] and never looks at the concrete type again.

pub mod cooperative;
pub mod process;
pub mod thread;

use crate::collector::{Outcome, OutcomeSink};
use crate::config::ExecutorConfig;
use crate::error::{Result, TaskError};
use crate::job::JobRegistry;
use crate::task::{Task, TaskContext, TaskId, TaskResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use cooperative::CooperativeBackend;
pub use process::ProcessBackend;
pub use thread::ThreadBackend;

/// Type alias for boxed async futures.
///
/// Used to enable dynamic dispatch for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Concurrency substrate used to run a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Bounded pool of OS threads sharing the caller's address space.
    Thread,
    /// Bounded pool of persistent worker processes.
    Process,
    /// One thread, tasks interleaved at their suspension points.
    Cooperative,
}

impl Strategy {
    /// All strategies, in declaration order.
    pub const ALL: [Self; 3] = [Self::Thread, Self::Process, Self::Cooperative];

    /// Capabilities of the backend this strategy selects.
    #[must_use]
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Thread => ThreadBackend::CAPABILITIES,
            Self::Process => ProcessBackend::CAPABILITIES,
            Self::Cooperative => CooperativeBackend::CAPABILITIES,
        }
    }

    /// Lowercase name, as accepted by `FromStr`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process => "process",
            Self::Cooperative => "cooperative",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" | "threads" => Ok(Self::Thread),
            "process" | "processes" => Ok(Self::Process),
            "cooperative" | "async" => Ok(Self::Cooperative),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// What a backend can and cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// CPU-bound tasks actually run in parallel.
    pub provides_cpu_parallelism: bool,
    /// Tasks cannot see each other's memory.
    pub isolates_memory: bool,
    /// In-flight tasks can be stopped without their cooperation.
    pub forced_cancellation: bool,
    /// Only payloads that can be serialized are accepted.
    pub requires_serializable_payload: bool,
}

/// Lifecycle of one dispatched task as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Handed to the backend, not started.
    Queued,
    /// Payload is executing.
    Running,
    /// An outcome was recorded, or the backend dropped the task.
    Finished,
}

/// Result of [`Backend::await_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitStatus {
    /// Every handle finished.
    Complete,
    /// The deadline passed first.
    DeadlineElapsed,
}

/// Caller-side reference to a dispatched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    token: CancellationToken,
    state: watch::Receiver<HandleState>,
}

impl TaskHandle {
    /// Returns the task id.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        if self.state.has_changed().is_err() {
            // Sender gone: the backend dropped the task.
            return HandleState::Finished;
        }
        *self.state.borrow()
    }

    /// Returns true once the task can no longer change.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == HandleState::Finished
    }

    /// Waits until the task is finished.
    pub async fn finished(&self) {
        let mut state = self.state.clone();
        // An error means the sender was dropped, which also ends the task.
        let _ = state.wait_for(|s| *s == HandleState::Finished).await;
    }

    /// Signals the task's cancellation token.
    pub fn request_cancel(&self) {
        self.token.cancel();
    }
}

/// A task admitted by the executor and handed to a backend.
///
/// Holds the admission permit; it is released when the task's outcome has
/// been recorded (or the dispatch is dropped).
pub struct Dispatch {
    task: Arc<Task>,
    token: CancellationToken,
    state: watch::Sender<HandleState>,
    sink: OutcomeSink,
    permit: OwnedSemaphorePermit,
}

impl Dispatch {
    pub(crate) fn new(
        task: Arc<Task>,
        token: CancellationToken,
        sink: OutcomeSink,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let (state, _) = watch::channel(HandleState::Queued);
        Self {
            task,
            token,
            state,
            sink,
            permit,
        }
    }

    /// Returns the task.
    #[must_use]
    pub const fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Creates a handle observing this dispatch.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task.id().clone(),
            token: self.token.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Marks the task as running.
    ///
    /// If the task was cancelled while queued, records a CANCELLED outcome
    /// without running anything and returns `None`.
    #[must_use]
    pub fn start(self) -> Option<RunningTask> {
        let now = self.sink.now();
        if self.token.is_cancelled() {
            debug!("Task {} cancelled before start", self.task.id());
            self.sink.record(Outcome::from_result(
                self.task.id().clone(),
                Err(TaskError::Cancelled),
                now,
                now,
            ));
            self.state.send_replace(HandleState::Finished);
            return None;
        }

        self.state.send_replace(HandleState::Running);
        Some(RunningTask {
            dispatch: self,
            started_at: now,
        })
    }
}

/// A dispatch whose payload has started.
pub struct RunningTask {
    dispatch: Dispatch,
    started_at: Duration,
}

impl RunningTask {
    /// Returns the task.
    #[must_use]
    pub const fn task(&self) -> &Arc<Task> {
        &self.dispatch.task
    }

    /// Returns the task id.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        self.dispatch.task.id()
    }

    /// Returns the task's cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.dispatch.token
    }

    /// Builds the context handed to the payload.
    #[must_use]
    pub fn context(&self) -> TaskContext {
        TaskContext::new(self.task_id().clone(), self.dispatch.token.clone())
    }

    /// Records the outcome, then releases the admission permit.
    pub fn finish(self, result: TaskResult) {
        let Dispatch {
            task,
            state,
            sink,
            permit,
            ..
        } = self.dispatch;
        let finished_at = sink.now();
        sink.record(Outcome::from_result(
            task.id().clone(),
            result,
            self.started_at,
            finished_at,
        ));
        state.send_replace(HandleState::Finished);
        drop(permit);
    }
}

/// Trait for running tasks on one concurrency substrate.
///
/// Backends own the outcome of every task they start: each started task
/// ends in exactly one call to [`RunningTask::finish`], and a task cancelled
/// while queued is closed by [`Dispatch::start`].
///
/// Implementations must ensure that:
/// - A payload error or panic becomes that task's outcome and nothing else
/// - A broken substrate fails only the task it was running
/// - `shutdown` never waits for a payload that ignores cancellation
pub trait Backend: Send + Sync {
    /// Queues a dispatched task and returns its handle.
    fn submit(&self, dispatch: Dispatch) -> TaskHandle;

    /// Waits until every handle is finished or `deadline` passes.
    fn await_all<'a>(
        &'a self,
        handles: &'a [TaskHandle],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, AwaitStatus> {
        Box::pin(async move {
            let all = async {
                for handle in handles {
                    handle.finished().await;
                }
            };
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, all).await {
                    Ok(()) => AwaitStatus::Complete,
                    Err(_) => AwaitStatus::DeadlineElapsed,
                },
                None => {
                    all.await;
                    AwaitStatus::Complete
                }
            }
        })
    }

    /// Cancels one task, best effort.
    ///
    /// A queued task will be closed as CANCELLED when it is picked up. A
    /// running task sees its token fire; whether that stops it depends on
    /// the backend's [`Capabilities::forced_cancellation`].
    fn cancel(&self, handle: &TaskHandle) {
        debug!("Cancelling task {} on {}", handle.task_id(), self.name());
        handle.request_cancel();
    }

    /// Returns what this backend can do.
    fn capabilities(&self) -> Capabilities;

    /// Returns a human-readable name for this backend.
    fn name(&self) -> &'static str;

    /// Stops accepting work and releases the substrate.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Starts the backend selected by `strategy`.
///
/// # Errors
///
/// Returns an error if the substrate cannot be brought up (threads cannot
/// be spawned, worker processes fail their handshake).
pub async fn start(
    strategy: Strategy,
    max_concurrency: usize,
    config: &ExecutorConfig,
    registry: Arc<JobRegistry>,
) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match strategy {
        Strategy::Thread => Box::new(ThreadBackend::start(max_concurrency, registry)?),
        Strategy::Process => Box::new(ProcessBackend::start(max_concurrency, config).await?),
        Strategy::Cooperative => Box::new(CooperativeBackend::start(registry)?),
    };
    Ok(backend)
}

/// Runs a task's payload to completion inside the current runtime.
///
/// The payload is spawned so a panic surfaces as [`TaskError::Panicked`]
/// instead of unwinding through the backend.
pub(crate) async fn drive(
    task: Arc<Task>,
    ctx: TaskContext,
    registry: Arc<JobRegistry>,
) -> TaskResult {
    let join = tokio::spawn(async move { task.invoke(ctx, &registry).await });
    match join.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(TaskError::Panicked(panic_message(&*err.into_panic()))),
        Err(err) => Err(TaskError::backend(err)),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
