//! Worker process backend.
//!
//! Runs tasks in a pool of persistent `taskmux-worker` processes. Each
//! worker is driven by one lane: a tokio task that pulls the next dispatch,
//! sends it as a [`WorkerRequest::Run`] frame and waits for the matching
//! reply. Only named jobs cross the boundary; the worker resolves them in
//! its own registry.
//!
//! Cancelling a running task kills its worker. A worker that crashes or
//! breaks the protocol fails only the task it was running; the lane spawns
//! a replacement before the next task. An idle worker is pinged before it
//! is reused and replaced if it does not answer.

use crate::backend::{Backend, BoxFuture, Capabilities, Dispatch, RunningTask, TaskHandle};
use crate::config::ExecutorConfig;
use crate::error::{Result, TaskError, TaskmuxError};
use crate::task::{JobSpec, TaskId, TaskResult};
use crate::wire::{read_frame, write_frame, WorkerRequest, WorkerResponse};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for a worker to exit after a shutdown request.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long an idle worker has to answer a ping.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Dispatch>>>;

/// Runs tasks in a pool of worker processes.
pub struct ProcessBackend {
    sender: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
    lanes: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
    size: usize,
}

impl ProcessBackend {
    /// Capabilities of the process backend.
    pub const CAPABILITIES: Capabilities = Capabilities {
        provides_cpu_parallelism: true,
        isolates_memory: true,
        forced_cancellation: true,
        requires_serializable_payload: true,
    };

    /// Starts `size` worker processes and their lanes.
    ///
    /// Every worker must complete its ready handshake before this returns.
    /// Must be called from within a tokio runtime; the lanes run on it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskmuxError::WorkerStartup`] if the worker binary cannot
    /// be found, spawned, or does not report ready in time.
    pub async fn start(size: usize, config: &ExecutorConfig) -> Result<Self> {
        let size = size.max(1);
        let spawner = Arc::new(WorkerSpawner {
            program: config.resolve_worker_program()?,
            startup_timeout: config.worker_startup_timeout,
            max_frame_len: config.max_frame_len,
        });

        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            workers.push(spawner.spawn().await?);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: Queue = Arc::new(tokio::sync::Mutex::new(receiver));
        let stop = CancellationToken::new();

        let lanes: Vec<JoinHandle<()>> = workers
            .into_iter()
            .enumerate()
            .map(|(index, worker)| {
                let lane = Lane {
                    index,
                    worker: Some(worker),
                    spawner: Arc::clone(&spawner),
                    queue: Arc::clone(&queue),
                    stop: stop.clone(),
                };
                tokio::spawn(lane.run())
            })
            .collect();

        info!(
            "ProcessBackend started {size} workers from {}",
            spawner.program.display()
        );
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            lanes: Mutex::new(lanes),
            stop,
            size,
        })
    }

    /// Returns the number of lanes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Backend for ProcessBackend {
    fn submit(&self, dispatch: Dispatch) -> TaskHandle {
        let handle = dispatch.handle();
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(dispatch).err().map(|e| e.0),
            None => Some(dispatch),
        };

        if let Some(dispatch) = rejected {
            warn!("ProcessBackend is shut down, failing task {}", handle.task_id());
            if let Some(running) = dispatch.start() {
                running.finish(Err(TaskError::backend("worker pool is shut down")));
            }
        }
        handle
    }

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn name(&self) -> &'static str {
        "process"
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.sender.lock().take();
            self.stop.cancel();
            let lanes = std::mem::take(&mut *self.lanes.lock());
            for lane in lanes {
                if let Err(e) = lane.await {
                    error!("Worker lane ended abnormally: {e}");
                }
            }
            debug!("ProcessBackend shut down");
        })
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        // Lanes exit on their own; their workers are killed on drop.
        self.stop.cancel();
    }
}

struct WorkerSpawner {
    program: PathBuf,
    startup_timeout: Duration,
    max_frame_len: usize,
}

impl WorkerSpawner {
    async fn spawn(&self) -> Result<WorkerProcess> {
        let startup_error = |reason: String| TaskmuxError::WorkerStartup {
            program: self.program.clone(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .env("TASKMUX_MAX_FRAME_BYTES", self.max_frame_len.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| startup_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| startup_error("stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| startup_error("stdout not captured".to_string()))?;

        let hello = timeout(
            self.startup_timeout,
            read_frame::<_, WorkerResponse>(&mut stdout, self.max_frame_len),
        )
        .await;
        let pid = match hello {
            Ok(Ok(Some(WorkerResponse::Ready { pid }))) => pid,
            Ok(Ok(Some(other))) => {
                return Err(startup_error(format!("expected ready, got {other:?}")))
            }
            Ok(Ok(None)) => return Err(startup_error("exited before reporting ready".to_string())),
            Ok(Err(e)) => return Err(startup_error(e.to_string())),
            Err(_) => {
                return Err(startup_error(format!(
                    "no ready message within {:?}",
                    self.startup_timeout
                )))
            }
        };

        debug!("Worker process {pid} ready");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout,
            pid,
            max_frame_len: self.max_frame_len,
        })
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    max_frame_len: usize,
}

impl WorkerProcess {
    /// Sends one job and waits for its reply.
    ///
    /// The outer error means the channel broke; the inner result is the
    /// task's own.
    async fn run(&mut self, task_id: &TaskId, job: &JobSpec) -> Result<TaskResult> {
        let request = WorkerRequest::Run {
            task_id: task_id.as_str().to_string(),
            job: job.name.clone(),
            input: serde_json::to_vec(&job.input)?,
        };
        write_frame(&mut self.stdin, &request, self.max_frame_len).await?;

        loop {
            match read_frame::<_, WorkerResponse>(&mut self.stdout, self.max_frame_len).await? {
                Some(WorkerResponse::Finished { task_id: id, result }) if id == task_id.as_str() => {
                    return Ok(result.and_then(|bytes| {
                        serde_json::from_slice(&bytes).map_err(TaskError::failed)
                    }));
                }
                Some(other) => {
                    return Err(TaskmuxError::Protocol(format!(
                        "unexpected reply for task {task_id}: {other:?}"
                    )))
                }
                None => {
                    return Err(TaskmuxError::Protocol(format!(
                        "worker {} exited while running task {task_id}",
                        self.pid
                    )))
                }
            }
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Returns true if the worker answers a ping within `within`.
    async fn ping(&mut self, within: Duration) -> bool {
        let exchange = async {
            write_frame(&mut self.stdin, &WorkerRequest::Ping, self.max_frame_len).await?;
            read_frame::<_, WorkerResponse>(&mut self.stdout, self.max_frame_len).await
        };
        match timeout(within, exchange).await {
            Ok(Ok(Some(WorkerResponse::Pong))) => true,
            Ok(Ok(Some(other))) => {
                warn!("Worker {} answered ping with {other:?}", self.pid);
                false
            }
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                debug!("Ping to worker {} failed: {e}", self.pid);
                false
            }
            Err(_) => {
                warn!("Worker {} did not answer ping within {within:?}", self.pid);
                false
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Killing worker {} failed: {e}", self.pid);
        }
    }

    async fn close(mut self) {
        let _ = write_frame(&mut self.stdin, &WorkerRequest::Shutdown, self.max_frame_len).await;
        if timeout(CLOSE_GRACE, self.child.wait()).await.is_err() {
            warn!("Worker {} ignored shutdown, killing it", self.pid);
            self.kill().await;
        }
    }
}

enum Step {
    Cancelled,
    Replied(TaskResult),
    Broken(TaskmuxError),
}

struct Lane {
    index: usize,
    worker: Option<WorkerProcess>,
    spawner: Arc<WorkerSpawner>,
    queue: Queue,
    stop: CancellationToken,
}

impl Lane {
    async fn run(mut self) {
        while let Some(dispatch) = self.next().await {
            if let Some(running) = dispatch.start() {
                self.execute(running).await;
            }
        }

        if let Some(worker) = self.worker.take() {
            worker.close().await;
        }
        debug!("Worker lane {} stopped", self.index);
    }

    async fn next(&self) -> Option<Dispatch> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            () = self.stop.cancelled() => None,
            dispatch = queue.recv() => dispatch,
        }
    }

    async fn ready_worker(&mut self) -> Result<WorkerProcess> {
        if let Some(mut worker) = self.worker.take() {
            if !worker.has_exited() && worker.ping(PING_TIMEOUT).await {
                return Ok(worker);
            }
            warn!("Worker {} on lane {} died while idle", worker.pid, self.index);
            worker.kill().await;
        }
        let worker = self.spawner.spawn().await?;
        info!("Lane {} started replacement worker {}", self.index, worker.pid);
        Ok(worker)
    }

    async fn execute(&mut self, running: RunningTask) {
        let Some(job) = running.task().payload().as_job().cloned() else {
            running.finish(Err(TaskError::backend(
                "local payload cannot run in a worker process",
            )));
            return;
        };

        let mut worker = match self.ready_worker().await {
            Ok(worker) => worker,
            Err(e) => {
                error!("Lane {} could not start a worker: {e}", self.index);
                running.finish(Err(TaskError::backend(e)));
                return;
            }
        };

        let token = running.token().clone();
        let step = tokio::select! {
            biased;
            () = token.cancelled() => Step::Cancelled,
            () = self.stop.cancelled() => Step::Cancelled,
            reply = worker.run(running.task_id(), &job) => match reply {
                Ok(result) => Step::Replied(result),
                Err(e) => Step::Broken(e),
            },
        };

        match step {
            Step::Replied(result) => {
                self.worker = Some(worker);
                running.finish(result);
            }
            Step::Cancelled => {
                debug!(
                    "Killing worker {} to cancel task {}",
                    worker.pid,
                    running.task_id()
                );
                worker.kill().await;
                running.finish(Err(TaskError::Cancelled));
            }
            Step::Broken(e) => {
                warn!(
                    "Worker {} failed running task {}: {e}",
                    worker.pid,
                    running.task_id()
                );
                worker.kill().await;
                running.finish(Err(TaskError::backend(e)));
            }
        }
    }
}
