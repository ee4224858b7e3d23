//! Thread pool backend.
//!
//! A fixed set of named OS threads pulls dispatches from one shared queue.
//! Each thread owns a small current-thread tokio runtime, so async payloads
//! and the [`TaskContext`](crate::task::TaskContext) wait primitives work the
//! same way they do on the other backends, while CPU-bound payloads get a
//! whole core.

use crate::backend::{drive, Backend, BoxFuture, Capabilities, Dispatch, TaskHandle};
use crate::error::{Result, TaskError};
use crate::job::JobRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type Queue = Arc<Mutex<mpsc::UnboundedReceiver<Dispatch>>>;

/// Runs tasks on a bounded pool of OS threads.
///
/// A running payload cannot be stopped from outside: cancellation only
/// fires its token. `shutdown` therefore detaches the threads instead of
/// joining them; a thread still busy with a payload that ignores its token
/// exits on its own once the payload returns.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskmux::backend::{Backend, ThreadBackend};
/// use taskmux::job::JobRegistry;
///
/// let backend = ThreadBackend::start(2, Arc::new(JobRegistry::builtin())).unwrap();
/// assert_eq!(backend.name(), "thread");
/// assert_eq!(backend.size(), 2);
/// ```
pub struct ThreadBackend {
    sender: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
    size: usize,
}

impl ThreadBackend {
    /// Capabilities of every thread backend.
    pub const CAPABILITIES: Capabilities = Capabilities {
        provides_cpu_parallelism: true,
        isolates_memory: false,
        forced_cancellation: false,
        requires_serializable_payload: false,
    };

    /// Spawns `size` worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a thread.
    pub fn start(size: usize, registry: Arc<JobRegistry>) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: Queue = Arc::new(Mutex::new(receiver));

        for index in 0..size {
            let queue = Arc::clone(&queue);
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name(format!("taskmux-thread-{index}"))
                .spawn(move || worker_loop(index, &queue, &registry))
                .map_err(|e| {
                    error!("Failed to spawn worker thread {index}: {e}");
                    e
                })?;
        }

        info!("ThreadBackend started with {size} threads");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            size,
        })
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

fn next(queue: &Queue) -> Option<Dispatch> {
    // The lock is held while parked so exactly one idle thread waits on
    // the channel at a time.
    queue.lock().blocking_recv()
}

fn worker_loop(index: usize, queue: &Queue, registry: &Arc<JobRegistry>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Worker thread {index} could not build its runtime: {e}");
            fail_remaining(queue, &e.to_string());
            return;
        }
    };

    debug!("Worker thread {index} started");
    while let Some(dispatch) = next(queue) {
        run_one(&runtime, dispatch, registry);
    }
    debug!("Worker thread {index} stopped");
}

fn run_one(runtime: &Runtime, dispatch: Dispatch, registry: &Arc<JobRegistry>) {
    let Some(running) = dispatch.start() else {
        return;
    };
    let task = Arc::clone(running.task());
    let ctx = running.context();
    let result = runtime.block_on(drive(task, ctx, Arc::clone(registry)));
    running.finish(result);
}

fn fail_remaining(queue: &Queue, reason: &str) {
    while let Some(dispatch) = next(queue) {
        if let Some(running) = dispatch.start() {
            running.finish(Err(TaskError::backend(format!(
                "worker thread has no runtime: {reason}"
            ))));
        }
    }
}

impl Backend for ThreadBackend {
    fn submit(&self, dispatch: Dispatch) -> TaskHandle {
        let handle = dispatch.handle();
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(dispatch).err().map(|e| e.0),
            None => Some(dispatch),
        };

        if let Some(dispatch) = rejected {
            warn!("ThreadBackend is shut down, failing task {}", handle.task_id());
            if let Some(running) = dispatch.start() {
                running.finish(Err(TaskError::backend("thread pool is shut down")));
            }
        }
        handle
    }

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn name(&self) -> &'static str {
        "thread"
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.sender.lock().take().is_some() {
                debug!("ThreadBackend shutting down");
            }
        })
    }
}

impl Drop for ThreadBackend {
    fn drop(&mut self) {
        self.sender.get_mut().take();
    }
}
