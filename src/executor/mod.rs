//! The executor.
//!
//! An [`Executor`] runs one [`ExecutionRequest`] at a time through the
//! backend its strategy selects:
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED | PARTIAL | ABORTED
//! ```
//!
//! Validation happens while PENDING and is the only place a request can
//! fail. Once RUNNING, every task ends up with exactly one outcome in the
//! report, whatever happens to its payload or to the backend.

mod request;

pub use request::{ExecutionHandle, ExecutionRequest, ExecutionRequestBuilder, ExecutionState};

use crate::backend::{self, AwaitStatus, Backend, Dispatch, Strategy, TaskHandle};
use crate::collector::{
    BatchEnd, ExecutionReport, OutcomeObserver, OutcomeSink, OutcomeStatus, OverallStatus,
    ResultCollector,
};
use crate::config::ExecutorConfig;
use crate::error::{Result, TaskmuxError};
use crate::job::JobRegistry;
use crate::task::{Task, TaskId, TaskKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs execution requests.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use taskmux::executor::{ExecutionRequest, Executor};
/// use taskmux::{OverallStatus, Strategy, Task};
///
/// #[tokio::main]
/// async fn main() -> taskmux::error::Result<()> {
///     let executor = Executor::new();
///
///     let request = ExecutionRequest::builder()
///         .tasks((0..4).map(|i| {
///             Task::builder()
///                 .id(format!("sum-{i}"))
///                 .job("sum_range", json!({"n": 1_000_000}))
///                 .build()
///         }).collect::<Result<Vec<_>, _>>()?)
///         .strategy(Strategy::Process)
///         .max_concurrency(4)
///         .build()?;
///
///     let report = executor.execute(request).await?;
///     assert_eq!(report.overall_status(), OverallStatus::Completed);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<JobRegistry>,
    observer: Option<Arc<dyn OutcomeObserver>>,
}

impl Executor {
    /// Creates an executor with the built-in jobs and `TASKMUX_*` settings.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new executor builder.
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Returns the job registry used by the thread and cooperative backends.
    #[must_use]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Runs a request to completion.
    ///
    /// # Errors
    ///
    /// Returns a submission error if the request does not fit its strategy,
    /// or an error if the backend cannot be started. Task failures, timeouts
    /// and cancellation are reported inside the [`ExecutionReport`].
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let ExecutionRequest {
            tasks,
            strategy,
            max_concurrency,
            timeout,
            control,
        } = request;
        let batch = control.id;

        self.validate(&tasks, strategy)?;

        let backend = backend::start(
            strategy,
            max_concurrency,
            &self.config,
            Arc::clone(&self.registry),
        )
        .await?;

        let collector = Arc::new(match &self.observer {
            Some(observer) => ResultCollector::with_observer(Arc::clone(observer)),
            None => ResultCollector::new(),
        });
        let sink = OutcomeSink::new(Arc::clone(&collector));
        let gate = Arc::new(Semaphore::new(max_concurrency));
        let deadline = timeout.map(|t| Instant::now() + t);
        let submission_order: Vec<TaskId> = tasks.iter().map(|t| t.id().clone()).collect();

        info!(
            "Batch {batch}: running {} tasks on {} (max_concurrency={max_concurrency}, timeout={timeout:?})",
            tasks.len(),
            backend.name()
        );
        control.set(ExecutionState::Running);

        let mut handles = Vec::with_capacity(tasks.len());
        let drain = async {
            admit_all(backend.as_ref(), tasks, &gate, &control.token, &sink, &mut handles).await;
            backend.await_all(&handles, None).await
        };
        // Cancel and deadline stay armed until every outcome is in.
        let end = tokio::select! {
            biased;
            () = control.token.cancelled() => BatchEnd::Cancelled,
            () = deadline_elapsed(deadline) => BatchEnd::DeadlineElapsed,
            status = drain => match status {
                AwaitStatus::Complete => BatchEnd::Drained,
                AwaitStatus::DeadlineElapsed => BatchEnd::DeadlineElapsed,
            },
        };

        // Freeze first so tasks interrupted below stay TIMED_OUT.
        let report = collector.finalize(&submission_order, end, sink.now());
        if end != BatchEnd::Drained {
            cancel_unfinished(backend.as_ref(), &handles);
        }
        backend.shutdown().await;

        let state = match report.overall_status() {
            OverallStatus::Completed => ExecutionState::Completed,
            OverallStatus::Partial => ExecutionState::Partial,
            OverallStatus::Aborted => ExecutionState::Aborted,
        };
        control.set(state);
        info!(
            "Batch {batch}: {state} after {:?} ({} of {} succeeded)",
            report.elapsed(),
            report.count(OutcomeStatus::Success),
            report.len()
        );

        Ok(report)
    }

    /// Runs a request on a fresh runtime, blocking the caller.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus I/O errors building the
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a tokio runtime.
    pub fn execute_blocking(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.execute(request))
    }

    fn validate(&self, tasks: &[Task], strategy: Strategy) -> Result<()> {
        let capabilities = strategy.capabilities();

        if capabilities.requires_serializable_payload {
            if let Some(task) = tasks.iter().find(|t| !t.payload().is_serializable()) {
                return Err(TaskmuxError::PayloadNotSerializable {
                    task_id: task.id().clone(),
                });
            }
        }

        if !capabilities.provides_cpu_parallelism {
            let mut cpu_bound = tasks.iter().filter(|t| t.kind() == TaskKind::CpuBound);
            if let Some(first) = cpu_bound.next() {
                if self.config.strict_cpu_parallelism {
                    return Err(TaskmuxError::CpuParallelismUnavailable {
                        task_id: first.id().clone(),
                        backend: strategy.as_str(),
                    });
                }
                warn!(
                    "{} CPU-bound task(s) will not run in parallel on the {strategy} backend (first: {})",
                    1 + cpu_bound.count(),
                    first.id()
                );
            }
        }

        Ok(())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Builder for [`Executor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    config: Option<ExecutorConfig>,
    registry: Option<JobRegistry>,
    observer: Option<Arc<dyn OutcomeObserver>>,
}

impl ExecutorBuilder {
    /// Sets the configuration (default: [`ExecutorConfig::from_env`]).
    #[must_use]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the job registry (default: [`JobRegistry::builtin`]).
    ///
    /// Worker processes only know the jobs compiled into the worker binary;
    /// jobs registered here are visible to the thread and cooperative
    /// backends.
    #[must_use]
    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets an observer that sees every accepted outcome.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builds the executor.
    #[must_use]
    pub fn build(self) -> Executor {
        Executor {
            config: self.config.unwrap_or_else(ExecutorConfig::from_env),
            registry: Arc::new(self.registry.unwrap_or_else(JobRegistry::builtin)),
            observer: self.observer,
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Dispatches tasks in submission order as admission permits free up.
async fn admit_all(
    backend: &dyn Backend,
    tasks: Vec<Task>,
    gate: &Arc<Semaphore>,
    batch: &CancellationToken,
    sink: &OutcomeSink,
    handles: &mut Vec<TaskHandle>,
) {
    for task in tasks {
        let Ok(permit) = Arc::clone(gate).acquire_owned().await else {
            return;
        };
        if batch.is_cancelled() {
            return;
        }
        debug!("Admitting task {}", task.id());
        let dispatch = Dispatch::new(Arc::new(task), batch.child_token(), sink.clone(), permit);
        handles.push(backend.submit(dispatch));
    }
}

fn cancel_unfinished(backend: &dyn Backend, handles: &[TaskHandle]) {
    let mut cancelled = 0_usize;
    for handle in handles.iter().filter(|h| !h.is_finished()) {
        backend.cancel(handle);
        cancelled += 1;
    }
    if cancelled > 0 {
        debug!("Cancelled {cancelled} unfinished tasks on {}", backend.name());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collector::Outcome;
    use crate::error::TaskError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor() -> Executor {
        Executor::builder().config(ExecutorConfig::default()).build()
    }

    fn echo(id: &str) -> Task {
        Task::builder().id(id).job("echo", json!(id)).build().unwrap()
    }

    #[tokio::test]
    async fn test_all_tasks_get_outcomes() {
        for strategy in [Strategy::Thread, Strategy::Cooperative] {
            let request = ExecutionRequest::builder()
                .tasks((0..10).map(|i| echo(&format!("t{i}"))))
                .strategy(strategy)
                .max_concurrency(3)
                .build()
                .unwrap();
            let handle = request.handle();

            let report = executor().execute(request).await.unwrap();
            assert_eq!(report.overall_status(), OverallStatus::Completed);
            assert_eq!(report.len(), 10);
            assert_eq!(report.completion_order().len(), 10);
            assert!(report.all_succeeded());
            assert_eq!(handle.state(), ExecutionState::Completed);
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_halt_siblings() {
        let request = ExecutionRequest::builder()
            .task(Task::builder().id("bad").job("fail", json!({"message": "x"})).build().unwrap())
            .task(Task::builder().id("unknown").job("missing", json!(null)).build().unwrap())
            .task(echo("good"))
            .strategy(Strategy::Thread)
            .max_concurrency(1)
            .build()
            .unwrap();

        let report = executor().execute(request).await.unwrap();
        assert_eq!(report.overall_status(), OverallStatus::Completed);
        assert_eq!(report.count(OutcomeStatus::Failure), 2);
        let unknown = report.get(&TaskId::from("unknown")).unwrap();
        assert_eq!(unknown.error(), Some(&TaskError::UnknownJob("missing".to_string())));
        assert!(report.get(&TaskId::from("good")).unwrap().is_success());
    }

    #[tokio::test]
    async fn test_local_payload_rejected_for_process() {
        let request = ExecutionRequest::builder()
            .task(Task::builder().id("closure").blocking(|_| Ok(json!(1))).build().unwrap())
            .strategy(Strategy::Process)
            .build()
            .unwrap();
        let err = executor().execute(request).await.unwrap_err();
        assert!(matches!(err, TaskmuxError::PayloadNotSerializable { .. }));
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_cpu_bound_cooperative() {
        let task = Task::builder()
            .id("crunch")
            .kind(TaskKind::CpuBound)
            .job("sum_range", json!({"n": 10}))
            .build()
            .unwrap();

        let strict = Executor::builder()
            .config(ExecutorConfig::default().strict_cpu_parallelism(true))
            .build();
        let request = ExecutionRequest::builder()
            .task(task.clone())
            .strategy(Strategy::Cooperative)
            .build()
            .unwrap();
        let err = strict.execute(request).await.unwrap_err();
        assert!(matches!(
            err,
            TaskmuxError::CpuParallelismUnavailable { backend: "cooperative", .. }
        ));

        let lenient = ExecutionRequest::builder()
            .task(task)
            .strategy(Strategy::Cooperative)
            .build()
            .unwrap();
        let report = executor().execute(lenient).await.unwrap();
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_deadline_marks_missing_timed_out() {
        let request = ExecutionRequest::builder()
            .task(echo("fast"))
            .task(Task::builder().id("slow").job("sleep", json!({"ms": 30_000})).build().unwrap())
            .strategy(Strategy::Cooperative)
            .max_concurrency(2)
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let handle = request.handle();

        let report = executor().execute(request).await.unwrap();
        assert_eq!(report.overall_status(), OverallStatus::Partial);
        assert!(report.get(&TaskId::from("fast")).unwrap().is_success());
        assert_eq!(
            report.get(&TaskId::from("slow")).unwrap().status(),
            OutcomeStatus::TimedOut
        );
        assert_eq!(handle.state(), ExecutionState::Partial);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_aborts() {
        let request = ExecutionRequest::builder()
            .tasks((0..4).map(|i| {
                Task::builder()
                    .id(format!("s{i}"))
                    .job("sleep", json!({"ms": 30_000}))
                    .build()
                    .unwrap()
            }))
            .strategy(Strategy::Thread)
            .max_concurrency(2)
            .build()
            .unwrap();
        let handle = request.handle();

        let canceller = handle.clone();
        tokio::spawn(async move {
            canceller.wait_for(ExecutionState::Running).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = executor().execute(request).await.unwrap();
        assert_eq!(report.overall_status(), OverallStatus::Aborted);
        assert_eq!(report.count(OutcomeStatus::Cancelled), 4);
        assert_eq!(handle.state(), ExecutionState::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_after_full_admission_aborts() {
        for strategy in [Strategy::Thread, Strategy::Cooperative] {
            let request = ExecutionRequest::builder()
                .tasks((0..3).map(|i| {
                    Task::builder()
                        .id(format!("s{i}"))
                        .job("sleep", json!({"ms": 30_000}))
                        .build()
                        .unwrap()
                }))
                .strategy(strategy)
                .max_concurrency(3)
                .build()
                .unwrap();
            let handle = request.handle();

            let canceller = handle.clone();
            tokio::spawn(async move {
                canceller.wait_for(ExecutionState::Running).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                canceller.cancel();
            });

            let started = std::time::Instant::now();
            let report = executor().execute(request).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(10), "{strategy}");
            assert_eq!(report.overall_status(), OverallStatus::Aborted, "{strategy}");
            assert_eq!(report.count(OutcomeStatus::Cancelled), 3, "{strategy}");
            assert_eq!(handle.state(), ExecutionState::Aborted, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_deadline_applies_after_full_admission() {
        for strategy in [Strategy::Thread, Strategy::Cooperative] {
            let request = ExecutionRequest::builder()
                .tasks((0..3).map(|i| {
                    Task::builder()
                        .id(format!("s{i}"))
                        .job("sleep", json!({"ms": 30_000}))
                        .build()
                        .unwrap()
                }))
                .strategy(strategy)
                .max_concurrency(3)
                .timeout(Duration::from_millis(150))
                .build()
                .unwrap();

            let started = std::time::Instant::now();
            let report = executor().execute(request).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(10), "{strategy}");
            assert_eq!(report.overall_status(), OverallStatus::Partial, "{strategy}");
            assert_eq!(report.count(OutcomeStatus::TimedOut), 3, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_outcome() {
        struct Counter(AtomicUsize);
        impl OutcomeObserver for Counter {
            fn on_outcome(&self, _outcome: &Outcome) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let executor = Executor::builder()
            .config(ExecutorConfig::default())
            .observer(Arc::clone(&counter) as Arc<dyn OutcomeObserver>)
            .build();
        let request = ExecutionRequest::builder()
            .tasks((0..5).map(|i| echo(&format!("t{i}"))))
            .strategy(Strategy::Cooperative)
            .build()
            .unwrap();

        executor.execute(request).await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_execute_blocking() {
        let request = ExecutionRequest::builder()
            .task(echo("a"))
            .strategy(Strategy::Thread)
            .build()
            .unwrap();
        let report = executor().execute_blocking(request).unwrap();
        assert_eq!(report.get(&TaskId::from("a")).unwrap().value(), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_custom_registry_job() {
        let mut registry = JobRegistry::builtin();
        registry.register_blocking("double", |input, _| {
            Ok(json!(input.as_i64().unwrap_or(0) * 2))
        });
        let executor = Executor::builder()
            .config(ExecutorConfig::default())
            .registry(registry)
            .build();

        let request = ExecutionRequest::builder()
            .task(Task::builder().id("d").job("double", json!(21)).build().unwrap())
            .strategy(Strategy::Cooperative)
            .build()
            .unwrap();
        let report = executor.execute(request).await.unwrap();
        assert_eq!(report.get(&TaskId::from("d")).unwrap().value(), Some(&json!(42)));
    }
}
