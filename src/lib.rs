//! # taskmux: one executor contract, three concurrency substrates
//!
//! taskmux runs a batch of independent tasks and hands back one report,
//! whether the tasks ran on a pool of OS threads, a pool of worker
//! processes, or a single-threaded cooperative scheduler. The strategy is a
//! request parameter; the task code, the report and the failure semantics
//! stay the same.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use serde_json::json;
//! use taskmux::{execute, OverallStatus, Strategy, Task};
//!
//! #[tokio::main]
//! async fn main() -> taskmux::error::Result<()> {
//!     let tasks = vec![
//!         Task::builder().id("fetch").job("sleep", json!({"ms": 50, "value": "ok"})).build()?,
//!         Task::builder()
//!             .id("crunch")
//!             .run(|ctx| async move {
//!                 ctx.yield_now().await?;
//!                 Ok(json!((0..1_000_u64).sum::<u64>()))
//!             })
//!             .build()?,
//!     ];
//!
//!     let report = execute(tasks, Strategy::Thread, 4, Some(Duration::from_secs(5))).await?;
//!     assert_eq!(report.overall_status(), OverallStatus::Completed);
//!
//!     for outcome in report.in_submission_order() {
//!         println!("{}: {} {:?}", outcome.task_id(), outcome.status(), outcome.value());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Task**: id, kind hint, and a payload (an in-process closure or a named job)
//! - **Backend**: thread, process or cooperative substrate behind one trait
//! - **Executor**: validates a request, admits tasks under `max_concurrency`,
//!   enforces the batch deadline and cancellation
//! - **Collector**: one outcome per task, frozen into an [`ExecutionReport`]
//!
//! Only failures that happen before anything runs (a malformed request, a
//! backend that cannot start) are returned as `Err`. Everything after that
//! is data in the report.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod backend;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod task;
pub mod wire;
pub mod worker;

pub use backend::{Capabilities, Strategy};
pub use collector::{ExecutionReport, Outcome, OutcomeStatus, OverallStatus};
pub use config::ExecutorConfig;
pub use error::{Result, TaskError, TaskmuxError};
pub use executor::{ExecutionHandle, ExecutionRequest, ExecutionState, Executor};
pub use job::JobRegistry;
pub use task::{Task, TaskContext, TaskId, TaskKind};

use std::time::Duration;

/// Runs `tasks` on `strategy` with the default executor.
///
/// Shorthand for building an [`ExecutionRequest`] and passing it to
/// [`Executor::new`]. Use those directly to cancel the batch from outside,
/// register custom jobs, or set an [`ExecutorConfig`].
///
/// # Errors
///
/// Returns an error if the batch is empty, contains duplicate ids,
/// `max_concurrency` is zero, a task does not fit the strategy, or the
/// backend cannot be started.
pub async fn execute(
    tasks: Vec<Task>,
    strategy: Strategy,
    max_concurrency: usize,
    timeout: Option<Duration>,
) -> Result<ExecutionReport> {
    let mut builder = ExecutionRequest::builder()
        .tasks(tasks)
        .strategy(strategy)
        .max_concurrency(max_concurrency);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Executor::new().execute(builder.build()?).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_convenience() {
        let tasks = (0..3)
            .map(|i| {
                Task::builder()
                    .id(format!("t{i}"))
                    .job("echo", json!(i))
                    .build()
                    .unwrap()
            })
            .collect();

        let report = execute(tasks, Strategy::Cooperative, 2, None).await.unwrap();
        assert_eq!(report.overall_status(), OverallStatus::Completed);
        assert_eq!(report.get(&TaskId::from("t2")).unwrap().value(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_batch() {
        let err = execute(Vec::new(), Strategy::Thread, 1, None).await.unwrap_err();
        assert!(err.is_submission_error());
    }
}
