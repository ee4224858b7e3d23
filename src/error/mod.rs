//! Error types for taskmux.
//!
//! Two families live here. [`TaskmuxError`] is returned from `execute` and only
//! describes requests that never reached the running state (plus the substrate
//! and codec failures behind them). [`TaskError`] is per-task data: it is stored
//! inside an [`Outcome`](crate::collector::Outcome) and never propagated.

use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for taskmux operations.
pub type Result<T> = std::result::Result<T, TaskmuxError>;

/// Errors that fail a whole request.
#[derive(Error, Debug)]
pub enum TaskmuxError {
    /// The batch contained no tasks.
    #[error("Execution request contains no tasks")]
    EmptyBatch,

    /// Two tasks in one batch share an identifier.
    #[error("Duplicate task id in batch: {task_id}")]
    DuplicateTaskId {
        /// The repeated identifier.
        task_id: TaskId,
    },

    /// `max_concurrency` was zero.
    #[error("max_concurrency must be at least 1, got {value}")]
    InvalidConcurrency {
        /// Rejected value.
        value: usize,
    },

    /// Invalid task configuration.
    #[error("Invalid task configuration: {reason}")]
    InvalidTask {
        /// Reason why task is invalid.
        reason: String,
    },

    /// A task holds an in-process closure but the strategy needs to ship it
    /// to another process.
    #[error("Task {task_id} has a local payload and cannot cross a process boundary")]
    PayloadNotSerializable {
        /// Offending task.
        task_id: TaskId,
    },

    /// Strict mode rejected a CPU-bound task on a backend without CPU parallelism.
    #[error("Task {task_id} is CPU-bound but the {backend} backend provides no CPU parallelism")]
    CpuParallelismUnavailable {
        /// Offending task.
        task_id: TaskId,
        /// Backend name.
        backend: &'static str,
    },

    /// A worker process could not be started.
    #[error("Worker startup failed ({program}): {reason}")]
    WorkerStartup {
        /// Program that was launched.
        program: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Malformed or unexpected frame on the worker channel.
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Serialization error on the worker channel.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error in the execution substrate.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TaskmuxError {
    /// Returns true for errors raised while validating a request.
    ///
    /// These are the submission errors: nothing was executed.
    #[must_use]
    pub const fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyBatch
                | Self::DuplicateTaskId { .. }
                | Self::InvalidConcurrency { .. }
                | Self::InvalidTask { .. }
                | Self::PayloadNotSerializable { .. }
                | Self::CpuParallelismUnavailable { .. }
        )
    }
}

impl From<bincode::Error> for TaskmuxError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TaskmuxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Why a single task did not produce a value.
///
/// Serializable so worker processes can report it verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    /// The payload returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The payload panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The payload observed its cancellation signal.
    #[error("task cancelled")]
    Cancelled,

    /// No job with this name is registered where the task ran.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The execution substrate broke while running the task.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl TaskError {
    /// Builds a payload failure from anything printable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Builds a backend failure from anything printable.
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend(message.to_string())
    }

    /// Returns true if the substrate, not the payload, is at fault.
    #[must_use]
    pub const fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("invalid job input: {err}"))
    }
}
