//! Named jobs.
//!
//! A closure cannot be sent to another process, but a name and a JSON input
//! can. Jobs are registered under a name on both sides of the boundary: the
//! executor resolves them for the in-process backends, and a worker process
//! resolves them from its own registry.

mod builtin;

use crate::error::TaskError;
use crate::task::{JobSpec, TaskContext, TaskFuture, TaskResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Handler behind a job name.
pub type JobFn = Arc<dyn Fn(Value, TaskContext) -> TaskFuture + Send + Sync>;

/// Table of jobs addressable by name.
///
/// # Example
///
/// ```
/// use taskmux::job::JobRegistry;
/// use serde_json::{json, Value};
///
/// let mut registry = JobRegistry::builtin();
/// registry.register_blocking("len", |input: Value, _ctx| {
///     Ok(json!(input.as_array().map_or(0, Vec::len)))
/// });
///
/// assert!(registry.contains("len"));
/// assert!(registry.contains("sum_range"));
/// ```
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobFn>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in jobs.
    ///
    /// | name        | input                        | result                 |
    /// |-------------|------------------------------|------------------------|
    /// | `echo`      | any                          | the input              |
    /// | `sleep`     | `{"ms": u64, "value"?: any}` | `value` or `null`      |
    /// | `sum_range` | `{"n": u64}`                 | sum of `0..n`          |
    /// | `fail`      | `{"message": string}`        | payload error          |
    /// | `panic`     | `{"message": string}`        | payload panics         |
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Registers an async job, replacing any job with the same name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let job: JobFn = Arc::new(move |input: Value, ctx: TaskContext| -> TaskFuture {
            Box::pin(f(input, ctx))
        });
        self.insert(name.into(), job);
        self
    }

    /// Registers a synchronous job, replacing any job with the same name.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, &TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        let job: JobFn = Arc::new(move |input: Value, ctx: TaskContext| -> TaskFuture {
            Box::pin(std::future::ready(f(input, &ctx)))
        });
        self.insert(name.into(), job);
        self
    }

    fn insert(&mut self, name: String, job: JobFn) {
        if self.jobs.insert(name.clone(), job).is_some() {
            debug!("Job '{name}' re-registered");
        }
    }

    /// Returns true if a job with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Returns the registered job names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Starts the job named by `spec`.
    ///
    /// An unknown name yields a future resolving to [`TaskError::UnknownJob`].
    #[must_use]
    pub fn run(&self, spec: &JobSpec, ctx: TaskContext) -> TaskFuture {
        match self.jobs.get(&spec.name) {
            Some(job) => job(spec.input.clone(), ctx),
            None => Box::pin(std::future::ready(Err(TaskError::UnknownJob(
                spec.name.clone(),
            )))),
        }
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext::detached(TaskId::from("job-test"))
    }

    #[test]
    fn test_builtin_names() {
        let registry = JobRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["echo", "fail", "panic", "sleep", "sum_range"]
        );
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let registry = JobRegistry::new();
        let spec = JobSpec::new("missing", Value::Null);
        let result = registry.run(&spec, ctx()).await;
        assert_eq!(result, Err(TaskError::UnknownJob("missing".to_string())));
    }

    #[tokio::test]
    async fn test_register_async_job() {
        let mut registry = JobRegistry::new();
        registry.register("delayed_add", |input: Value, ctx: TaskContext| async move {
            ctx.sleep(std::time::Duration::from_millis(1)).await?;
            let a = input["a"].as_i64().unwrap_or(0);
            let b = input["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let spec = JobSpec::new("delayed_add", json!({"a": 2, "b": 3}));
        assert_eq!(registry.run(&spec, ctx()).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let mut registry = JobRegistry::new();
        registry
            .register_blocking("v", |_, _| Ok(json!(1)))
            .register_blocking("v", |_, _| Ok(json!(2)));

        let spec = JobSpec::new("v", Value::Null);
        assert_eq!(registry.run(&spec, ctx()).await.unwrap(), json!(2));
        assert_eq!(registry.names(), vec!["v"]);
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = JobRegistry::builtin();
        assert!(format!("{registry:?}").contains("sum_range"));
    }
}
