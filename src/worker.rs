//! Worker side of the process backend.
//!
//! A worker process reads [`WorkerRequest`] frames from stdin and answers
//! on stdout, one job at a time. Logs go to stderr, which the executor
//! inherits.

use crate::backend::panic_message;
use crate::config::ExecutorConfig;
use crate::error::{Result, TaskError};
use crate::job::JobRegistry;
use crate::task::{JobSpec, TaskContext, TaskId, TaskResult};
use crate::wire::{read_frame, write_frame, WorkerRequest, WorkerResponse};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tracing::{debug, info, warn};

/// Serves requests on stdin/stdout until stdin closes or a shutdown arrives.
///
/// Custom worker binaries call this from `main` with their own registry.
/// The frame limit comes from `TASKMUX_MAX_FRAME_BYTES`, which the process
/// backend sets for every worker it spawns.
///
/// # Errors
///
/// Returns an error if the channel to the executor breaks.
pub async fn serve(registry: JobRegistry) -> Result<()> {
    let max_frame_len = ExecutorConfig::from_env().max_frame_len;
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = BufWriter::new(tokio::io::stdout());
    serve_on(registry, stdin, stdout, max_frame_len).await
}

/// Serves requests on an arbitrary byte channel.
///
/// # Errors
///
/// Returns an error if reading or writing a frame fails.
pub async fn serve_on<R, W>(
    registry: JobRegistry,
    mut reader: R,
    mut writer: W,
    max_frame_len: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let registry = Arc::new(registry);
    let pid = std::process::id();
    write_frame(&mut writer, &WorkerResponse::Ready { pid }, max_frame_len).await?;
    info!("Worker {pid} ready");

    while let Some(request) = read_frame::<_, WorkerRequest>(&mut reader, max_frame_len).await? {
        match request {
            WorkerRequest::Run { task_id, job, input } => {
                debug!("Worker {pid} running task {task_id} ({job})");
                let result = run_job(&registry, &task_id, job, &input)
                    .await
                    .and_then(|value| serde_json::to_vec(&value).map_err(TaskError::failed));
                let response = WorkerResponse::Finished { task_id, result };
                write_frame(&mut writer, &response, max_frame_len).await?;
            }
            WorkerRequest::Ping => {
                write_frame(&mut writer, &WorkerResponse::Pong, max_frame_len).await?;
            }
            WorkerRequest::Shutdown => {
                info!("Worker {pid} received shutdown");
                return Ok(());
            }
        }
    }

    warn!("Worker {pid} input closed");
    Ok(())
}

async fn run_job(
    registry: &Arc<JobRegistry>,
    task_id: &str,
    job: String,
    input: &[u8],
) -> TaskResult {
    let input = serde_json::from_slice(input)?;
    let spec = JobSpec::new(job, input);
    let ctx = TaskContext::detached(TaskId::from(task_id));
    let registry = Arc::clone(registry);

    let join = tokio::spawn(async move { registry.run(&spec, ctx).await });
    match join.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(TaskError::Panicked(panic_message(&*err.into_panic()))),
        Err(err) => Err(TaskError::backend(err)),
    }
}
