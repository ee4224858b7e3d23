//! Outcome collection.
//!
//! Backends record one [`Outcome`] per task into a [`ResultCollector`] from
//! whatever thread they run on. Once the executor decides the batch is over
//! it calls [`ResultCollector::finalize`], which fills in the tasks that never
//! reported and freezes everything into an [`ExecutionReport`].

use crate::error::TaskError;
use crate::task::{TaskId, TaskResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Final status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// Payload returned a value.
    Success,
    /// Payload returned an error, panicked, or its backend broke.
    Failure,
    /// Task was cancelled before or while running.
    Cancelled,
    /// Batch deadline passed before the task reported.
    TimedOut,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Recorded result of one task.
///
/// `started_at` and `finished_at` are offsets from the start of the batch,
/// measured on the executor's monotonic clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    task_id: TaskId,
    status: OutcomeStatus,
    value: Option<Value>,
    error: Option<TaskError>,
    started_at: Duration,
    finished_at: Duration,
}

impl Outcome {
    /// Builds an outcome from a payload result.
    #[must_use]
    pub fn from_result(
        task_id: TaskId,
        result: TaskResult,
        started_at: Duration,
        finished_at: Duration,
    ) -> Self {
        let (status, value, error) = match result {
            Ok(value) => (OutcomeStatus::Success, Some(value), None),
            Err(TaskError::Cancelled) => {
                (OutcomeStatus::Cancelled, None, Some(TaskError::Cancelled))
            }
            Err(err) => (OutcomeStatus::Failure, None, Some(err)),
        };
        Self {
            task_id,
            status,
            value,
            error,
            started_at,
            finished_at,
        }
    }

    /// Builds the outcome of a task that never reported.
    fn unreported(
        task_id: TaskId,
        status: OutcomeStatus,
        error: Option<TaskError>,
        at: Duration,
    ) -> Self {
        Self {
            task_id,
            status,
            value: None,
            error,
            started_at: at,
            finished_at: at,
        }
    }

    /// Returns the task ID.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Returns the status.
    #[must_use]
    pub const fn status(&self) -> OutcomeStatus {
        self.status
    }

    /// Returns whether the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Returns the value of a successful task.
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Returns the error of a failed or cancelled task.
    #[must_use]
    pub const fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Offset from batch start at which the task started.
    #[must_use]
    pub const fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Offset from batch start at which the task finished.
    #[must_use]
    pub const fn finished_at(&self) -> Duration {
        self.finished_at
    }

    /// Time the task spent running.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_sub(self.started_at)
    }

    /// Returns true if the `[started_at, finished_at)` intervals intersect.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.started_at < other.finished_at && other.started_at < self.finished_at
    }
}

/// Status of a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverallStatus {
    /// Every task reported an outcome.
    Completed,
    /// The deadline passed with outcomes missing.
    Partial,
    /// The caller cancelled the batch with outcomes missing.
    Aborted,
}

/// Why the executor stopped waiting for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// Every dispatched task finished.
    Drained,
    /// The batch deadline passed.
    DeadlineElapsed,
    /// The caller cancelled the batch.
    Cancelled,
}

/// Receives every outcome the collector accepts.
///
/// Diagnostics only: observers cannot influence the batch.
pub trait OutcomeObserver: Send + Sync {
    /// Called once per accepted outcome, in completion order.
    fn on_outcome(&self, outcome: &Outcome);
}

/// Frozen result of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    outcomes: HashMap<TaskId, Outcome>,
    submission_order: Vec<TaskId>,
    completion_order: Vec<TaskId>,
    overall_status: OverallStatus,
    elapsed: Duration,
}

impl ExecutionReport {
    /// Returns the overall status.
    #[must_use]
    pub const fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    /// Returns the outcome of one task.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<&Outcome> {
        self.outcomes.get(task_id)
    }

    /// Returns all outcomes keyed by task id.
    #[must_use]
    pub const fn outcomes(&self) -> &HashMap<TaskId, Outcome> {
        &self.outcomes
    }

    /// Returns the number of outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if the report holds no outcomes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Outcomes in the order the tasks were submitted.
    pub fn in_submission_order(&self) -> impl Iterator<Item = &Outcome> {
        self.submission_order
            .iter()
            .filter_map(|id| self.outcomes.get(id))
    }

    /// Ids of tasks that reported, in the order their outcomes arrived.
    ///
    /// Tasks filled in at finalization are not listed.
    #[must_use]
    pub fn completion_order(&self) -> &[TaskId] {
        &self.completion_order
    }

    /// Number of outcomes with the given status.
    #[must_use]
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status() == status)
            .count()
    }

    /// Returns true if every task succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.count(OutcomeStatus::Success) == self.outcomes.len()
    }

    /// Wall-clock time from batch start to finalization.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[derive(Default)]
struct CollectorState {
    outcomes: HashMap<TaskId, Outcome>,
    completion_order: Vec<TaskId>,
    finalized: bool,
}

/// Append-only, thread-safe outcome sink for one batch.
#[derive(Default)]
pub struct ResultCollector {
    state: Mutex<CollectorState>,
    observer: Option<Arc<dyn OutcomeObserver>>,
}

impl ResultCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector that reports accepted outcomes to `observer`.
    #[must_use]
    pub fn with_observer(observer: Arc<dyn OutcomeObserver>) -> Self {
        Self {
            state: Mutex::default(),
            observer: Some(observer),
        }
    }

    /// Records an outcome.
    ///
    /// Returns false, and drops the outcome, if the task already has one or
    /// the collector was finalized.
    pub fn record(&self, outcome: Outcome) -> bool {
        {
            let mut state = self.state.lock();
            if state.finalized {
                warn!(
                    "Dropping late outcome for task {} ({})",
                    outcome.task_id(),
                    outcome.status()
                );
                return false;
            }
            if state.outcomes.contains_key(outcome.task_id()) {
                warn!("Dropping duplicate outcome for task {}", outcome.task_id());
                return false;
            }

            debug!(
                "Task {} finished: {} in {:?}",
                outcome.task_id(),
                outcome.status(),
                outcome.duration()
            );
            state.completion_order.push(outcome.task_id().clone());
            if let Some(observer) = &self.observer {
                observer.on_outcome(&outcome);
            }
            state.outcomes.insert(outcome.task_id().clone(), outcome);
        }
        true
    }

    /// Returns the number of recorded outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the task has an outcome.
    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.state.lock().outcomes.contains_key(task_id)
    }

    /// Returns a copy of the task's outcome.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<Outcome> {
        self.state.lock().outcomes.get(task_id).cloned()
    }

    /// Returns true once [`finalize`](Self::finalize) ran.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Closes the collector and builds the report.
    ///
    /// Tasks in `submission_order` without an outcome are filled in
    /// according to `end`: TIMED_OUT after a deadline, CANCELLED after an
    /// abort, FAILURE if the backend lost them. After an abort the batch is
    /// ABORTED if any task ended CANCELLED; otherwise the overall status is
    /// COMPLETED whenever nothing had to be filled in.
    ///
    /// Later calls return a report over the same frozen outcomes.
    pub fn finalize(
        &self,
        submission_order: &[TaskId],
        end: BatchEnd,
        at: Duration,
    ) -> ExecutionReport {
        let mut state = self.state.lock();
        state.finalized = true;

        let (fill_status, fill_error) = match end {
            BatchEnd::DeadlineElapsed => (OutcomeStatus::TimedOut, None),
            BatchEnd::Cancelled => (OutcomeStatus::Cancelled, Some(TaskError::Cancelled)),
            BatchEnd::Drained => (
                OutcomeStatus::Failure,
                Some(TaskError::backend("no outcome was recorded")),
            ),
        };

        let mut outcomes = state.outcomes.clone();
        let mut missing = 0_usize;
        for task_id in submission_order {
            if !outcomes.contains_key(task_id) {
                missing += 1;
                outcomes.insert(
                    task_id.clone(),
                    Outcome::unreported(task_id.clone(), fill_status, fill_error.clone(), at),
                );
            }
        }

        let overall_status = match end {
            BatchEnd::DeadlineElapsed if missing > 0 => OverallStatus::Partial,
            BatchEnd::Cancelled
                if missing > 0
                    || outcomes.values().any(|o| o.status() == OutcomeStatus::Cancelled) =>
            {
                OverallStatus::Aborted
            }
            _ => OverallStatus::Completed,
        };
        if missing > 0 {
            debug!("Finalized batch with {missing} unreported tasks marked {fill_status}");
        }

        ExecutionReport {
            outcomes,
            submission_order: submission_order.to_vec(),
            completion_order: state.completion_order.clone(),
            overall_status,
            elapsed: at,
        }
    }
}

/// Cloneable handle backends use to timestamp and record outcomes.
#[derive(Clone)]
pub struct OutcomeSink {
    collector: Arc<ResultCollector>,
    epoch: Instant,
}

impl OutcomeSink {
    /// Creates a sink whose clock starts now.
    #[must_use]
    pub fn new(collector: Arc<ResultCollector>) -> Self {
        Self {
            collector,
            epoch: Instant::now(),
        }
    }

    /// Time elapsed since the sink was created.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Records an outcome; see [`ResultCollector::record`].
    pub fn record(&self, outcome: Outcome) -> bool {
        self.collector.record(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    #[test]
    fn test_outcome_from_result() {
        let ok = Outcome::from_result(TaskId::from("a"), Ok(json!(3)), ms(1), ms(4));
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&json!(3)));
        assert_eq!(ok.duration(), ms(3));

        let failed = Outcome::from_result(
            TaskId::from("b"),
            Err(TaskError::failed("nope")),
            ms(0),
            ms(1),
        );
        assert_eq!(failed.status(), OutcomeStatus::Failure);
        assert!(failed.value().is_none());

        let cancelled = Outcome::from_result(TaskId::from("c"), Err(TaskError::Cancelled), ms(0), ms(0));
        assert_eq!(cancelled.status(), OutcomeStatus::Cancelled);
    }

    #[test]
    fn test_overlap() {
        let a = Outcome::from_result(TaskId::from("a"), Ok(json!(null)), ms(0), ms(10));
        let b = Outcome::from_result(TaskId::from("b"), Ok(json!(null)), ms(10), ms(20));
        let c = Outcome::from_result(TaskId::from("c"), Ok(json!(null)), ms(5), ms(15));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_record_rejects_duplicates() {
        let collector = ResultCollector::new();
        assert!(collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1))));
        assert!(!collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(2)), ms(1), ms(2))));
        assert_eq!(collector.len(), 1);
        assert_eq!(collector.get(&TaskId::from("a")).unwrap().value(), Some(&json!(1)));
    }

    #[test]
    fn test_late_arrival_dropped() {
        let collector = ResultCollector::new();
        let report = collector.finalize(&ids(&["a"]), BatchEnd::DeadlineElapsed, ms(3));
        assert_eq!(report.overall_status(), OverallStatus::Partial);
        assert!(collector.is_finalized());

        assert!(!collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(9))));
        assert!(collector.is_empty());
    }

    #[test]
    fn test_finalize_completed() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("b"), Ok(json!(2)), ms(0), ms(1)));
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(2)));

        let report = collector.finalize(&ids(&["a", "b"]), BatchEnd::Drained, ms(2));
        assert_eq!(report.overall_status(), OverallStatus::Completed);
        assert_eq!(report.completion_order(), ids(&["b", "a"]).as_slice());
        let submitted: Vec<_> = report.in_submission_order().map(|o| o.task_id().clone()).collect();
        assert_eq!(submitted, ids(&["a", "b"]));
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_finalize_partial_keeps_real_status() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("fast"), Ok(json!(1)), ms(0), ms(1)));

        let report = collector.finalize(&ids(&["fast", "slow"]), BatchEnd::DeadlineElapsed, ms(3));
        assert_eq!(report.overall_status(), OverallStatus::Partial);
        assert_eq!(report.len(), 2);
        assert_eq!(report.get(&TaskId::from("fast")).unwrap().status(), OutcomeStatus::Success);
        assert_eq!(report.get(&TaskId::from("slow")).unwrap().status(), OutcomeStatus::TimedOut);
    }

    #[test]
    fn test_finalize_aborted() {
        let collector = ResultCollector::new();
        let report = collector.finalize(&ids(&["a", "b"]), BatchEnd::Cancelled, ms(0));
        assert_eq!(report.overall_status(), OverallStatus::Aborted);
        assert_eq!(report.count(OutcomeStatus::Cancelled), 2);
    }

    #[test]
    fn test_finalize_aborted_when_tasks_reported_cancelled() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1)));
        collector.record(Outcome::from_result(
            TaskId::from("b"),
            Err(TaskError::Cancelled),
            ms(0),
            ms(2),
        ));

        let report = collector.finalize(&ids(&["a", "b"]), BatchEnd::Cancelled, ms(2));
        assert_eq!(report.overall_status(), OverallStatus::Aborted);
        assert_eq!(report.count(OutcomeStatus::Success), 1);
        assert_eq!(report.count(OutcomeStatus::Cancelled), 1);
    }

    #[test]
    fn test_finalize_cancel_after_all_succeeded_is_completed() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1)));

        let report = collector.finalize(&ids(&["a"]), BatchEnd::Cancelled, ms(1));
        assert_eq!(report.overall_status(), OverallStatus::Completed);
    }

    #[test]
    fn test_cancel_after_everything_reported_is_completed() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1)));
        let report = collector.finalize(&ids(&["a"]), BatchEnd::Cancelled, ms(1));
        assert_eq!(report.overall_status(), OverallStatus::Completed);
    }

    #[test]
    fn test_drained_with_lost_task_marks_failure() {
        let collector = ResultCollector::new();
        let report = collector.finalize(&ids(&["lost"]), BatchEnd::Drained, ms(1));
        let outcome = report.get(&TaskId::from("lost")).unwrap();
        assert_eq!(outcome.status(), OutcomeStatus::Failure);
        assert!(outcome.error().unwrap().is_backend_failure());
    }

    #[test]
    fn test_observer_sees_accepted_outcomes() {
        struct Counter(AtomicUsize);
        impl OutcomeObserver for Counter {
            fn on_outcome(&self, _outcome: &Outcome) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let collector = ResultCollector::with_observer(Arc::clone(&counter) as Arc<dyn OutcomeObserver>);
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1)));
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!(1)), ms(0), ms(1)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_records() {
        let collector = Arc::new(ResultCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    collector.record(Outcome::from_result(
                        TaskId::from(format!("t{i}")),
                        Ok(json!(i)),
                        ms(0),
                        ms(1),
                    ))
                })
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap());
        }
        assert_eq!(collector.len(), 8);
    }

    #[test]
    fn test_report_serializes() {
        let collector = ResultCollector::new();
        collector.record(Outcome::from_result(TaskId::from("a"), Ok(json!({"x": 1})), ms(0), ms(1)));
        let report = collector.finalize(&ids(&["a"]), BatchEnd::Drained, ms(1));
        let text = serde_json::to_string(&report).unwrap();
        assert!(text.contains("\"Completed\""));
    }
}
