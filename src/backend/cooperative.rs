//! Cooperative backend.
//!
//! Every task of the batch runs on one dedicated thread driving a
//! current-thread tokio runtime. Tasks interleave only where they await.

use crate::backend::{drive, Backend, BoxFuture, Capabilities, Dispatch, TaskHandle};
use crate::error::{Result, TaskError};
use crate::job::JobRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Runs tasks as coroutines on a single scheduler thread.
///
/// Admission is still bounded by the executor, so at most
/// `max_concurrency` tasks are in flight, but none of them run in parallel.
/// A payload that blocks the thread stalls every other task.
pub struct CooperativeBackend {
    sender: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
}

impl CooperativeBackend {
    /// Capabilities of the cooperative backend.
    pub const CAPABILITIES: Capabilities = Capabilities {
        provides_cpu_parallelism: false,
        isolates_memory: false,
        forced_cancellation: false,
        requires_serializable_payload: false,
    };

    /// Spawns the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn start(registry: Arc<JobRegistry>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Dispatch>();

        thread::Builder::new()
            .name("taskmux-cooperative".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(dispatch) = receiver.recv().await {
                        tokio::spawn(run(dispatch, Arc::clone(&registry)));
                    }
                });
                debug!("Cooperative scheduler stopped");
                // Dropping the runtime drops every task still suspended,
                // which closes their handles.
            })
            .map_err(|e| {
                error!("Failed to spawn cooperative scheduler thread: {e}");
                e
            })?;

        info!("CooperativeBackend started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }
}

async fn run(dispatch: Dispatch, registry: Arc<JobRegistry>) {
    let Some(running) = dispatch.start() else {
        return;
    };
    let task = Arc::clone(running.task());
    let ctx = running.context();
    let result = drive(task, ctx, registry).await;
    running.finish(result);
}

impl Backend for CooperativeBackend {
    fn submit(&self, dispatch: Dispatch) -> TaskHandle {
        let handle = dispatch.handle();
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(dispatch).err().map(|e| e.0),
            None => Some(dispatch),
        };

        if let Some(dispatch) = rejected {
            warn!("CooperativeBackend is shut down, failing task {}", handle.task_id());
            if let Some(running) = dispatch.start() {
                running.finish(Err(TaskError::backend("cooperative scheduler is shut down")));
            }
        }
        handle
    }

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.sender.lock().take().is_some() {
                debug!("CooperativeBackend shutting down");
            }
        })
    }
}

impl Drop for CooperativeBackend {
    fn drop(&mut self) {
        self.sender.get_mut().take();
    }
}
