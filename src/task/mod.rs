//! Task definition.
//!
//! A task is an identifier, a hint about what kind of work it does, and a
//! payload. Tasks are immutable once built; the executor shares them with
//! backends behind an `Arc`.

mod context;

pub use context::TaskContext;

use crate::backend::BoxFuture;
use crate::error::{Result, TaskError, TaskmuxError};
use crate::job::JobRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a payload yields: a JSON value or the reason it has none.
pub type TaskResult = std::result::Result<Value, TaskError>;

/// Boxed future returned by a payload.
pub type TaskFuture = BoxFuture<'static, TaskResult>;

/// In-process payload closure.
pub type LocalFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Caller-chosen identifier of a task, unique within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Estimated nature of the work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskKind {
    /// Spends most of its time computing.
    CpuBound,
    /// Spends most of its time waiting.
    #[default]
    IoBound,
}

/// A named job plus its input, resolved through a [`JobRegistry`].
///
/// This is the payload form that can be shipped to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Registered job name.
    pub name: String,
    /// Job input.
    pub input: Value,
}

impl JobSpec {
    /// Creates a job reference.
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// The callable part of a task.
#[derive(Clone)]
pub enum Payload {
    /// Closure living in the caller's address space.
    Local(LocalFn),
    /// Serializable reference to a registered job.
    Job(JobSpec),
}

impl Payload {
    /// Returns true if this payload can cross a process boundary.
    #[must_use]
    pub const fn is_serializable(&self) -> bool {
        matches!(self, Self::Job(_))
    }

    /// Returns the job spec, if this is a job payload.
    #[must_use]
    pub const fn as_job(&self) -> Option<&JobSpec> {
        match self {
            Self::Job(spec) => Some(spec),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local(<closure>)"),
            Self::Job(spec) => f.debug_tuple("Job").field(spec).finish(),
        }
    }
}

/// A unit of work.
///
/// # Example
///
/// ```
/// use taskmux::task::{Task, TaskKind};
/// use serde_json::json;
///
/// let task = Task::builder()
///     .id("checksum")
///     .kind(TaskKind::CpuBound)
///     .job("sum_range", json!({ "n": 1_000 }))
///     .build()
///     .unwrap();
///
/// assert_eq!(task.id().as_str(), "checksum");
/// assert!(task.payload().is_serializable());
/// ```
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    payload: Payload,
}

impl Task {
    /// Creates a new task builder.
    #[must_use]
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// Returns the task ID.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    /// Returns the task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the payload.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Starts the payload, resolving job payloads through `registry`.
    ///
    /// Call this from inside the task that will drive the future: blocking
    /// payloads run their body here.
    pub fn invoke(&self, ctx: TaskContext, registry: &JobRegistry) -> TaskFuture {
        match &self.payload {
            Payload::Local(f) => f(ctx),
            Payload::Job(spec) => registry.run(spec, ctx),
        }
    }
}

/// Builder for [`Task`].
#[derive(Default)]
pub struct TaskBuilder {
    id: Option<TaskId>,
    kind: TaskKind,
    payload: Option<Payload>,
}

impl TaskBuilder {
    /// Sets the task id.
    #[must_use]
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the task kind.
    #[must_use]
    pub const fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Uses an async closure as the payload.
    #[must_use]
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let local: LocalFn = Arc::new(move |ctx: TaskContext| -> TaskFuture { Box::pin(f(ctx)) });
        self.payload = Some(Payload::Local(local));
        self
    }

    /// Uses a synchronous closure as the payload.
    ///
    /// The body runs to completion without yielding. On the cooperative
    /// backend it holds the scheduler thread for its whole duration.
    #[must_use]
    pub fn blocking<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        let local: LocalFn = Arc::new(move |ctx: TaskContext| -> TaskFuture {
            Box::pin(std::future::ready(f(&ctx)))
        });
        self.payload = Some(Payload::Local(local));
        self
    }

    /// Uses a registered job as the payload.
    #[must_use]
    pub fn job(mut self, name: impl Into<String>, input: Value) -> Self {
        self.payload = Some(Payload::Job(JobSpec::new(name, input)));
        self
    }

    /// Sets the payload directly.
    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is missing or empty, or no payload is set.
    pub fn build(self) -> Result<Task> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TaskmuxError::InvalidTask {
                reason: "Task id must be a non-empty string".to_string(),
            })?;

        let payload = self.payload.ok_or_else(|| TaskmuxError::InvalidTask {
            reason: format!("Task {id} has no payload"),
        })?;

        Ok(Task {
            id,
            kind: self.kind,
            payload,
        })
    }
}
