//! Framing for the executor to worker-process channel.
//!
//! Every message is a little-endian `u32` length followed by a bincode body.
//! Job inputs and results cross as JSON bytes because bincode cannot encode
//! a self-describing [`serde_json::Value`].

use crate::error::{Result, TaskError, TaskmuxError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Default upper bound for one frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Executor to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Run a registered job.
    Run {
        /// Task being run, echoed in the reply.
        task_id: String,
        /// Registered job name.
        job: String,
        /// JSON-encoded input.
        input: Vec<u8>,
    },
    /// Liveness check for an idle worker.
    Ping,
    /// Exit after this message.
    Shutdown,
}

/// Worker to executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Sent once after startup.
    Ready {
        /// Worker process id.
        pid: u32,
    },
    /// Result of a `Run` request.
    Finished {
        /// Task that was run.
        task_id: String,
        /// JSON-encoded value, or the task error.
        result: std::result::Result<Vec<u8>, TaskError>,
    },
    /// Reply to `Ping`.
    Pong,
}

/// Writes one frame and flushes the writer.
///
/// # Errors
///
/// Returns an error if the message cannot be encoded, exceeds `max_len`,
/// or the writer fails.
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message)?;
    if encoded.len() > max_len {
        return Err(TaskmuxError::Protocol(format!(
            "Frame too large: {} bytes (limit {max_len})",
            encoded.len()
        )));
    }
    let len = u32::try_from(encoded.len())
        .map_err(|_| TaskmuxError::Protocol(format!("Frame too large: {} bytes", encoded.len())))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` if the stream ended cleanly before a new frame began.
///
/// # Errors
///
/// Returns an error on a truncated frame, a length above `max_len`, or a
/// body that does not decode.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_len {
        warn!("Rejecting frame of {len} bytes (limit {max_len})");
        return Err(TaskmuxError::Protocol(format!(
            "Frame too large: {len} bytes (limit {max_len})"
        )));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TaskmuxError::Protocol(format!("Stream ended inside a {len} byte frame"))
        } else {
            e.into()
        }
    })?;

    Ok(Some(bincode::deserialize(&buffer)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &WorkerRequest::Ping, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let run = WorkerRequest::Run {
            task_id: "t1".to_string(),
            job: "echo".to_string(),
            input: b"[1,2]".to_vec(),
        };
        write_frame(&mut client, &run, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        drop(client);

        let first: Option<WorkerRequest> = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(first, Some(WorkerRequest::Ping));
        let second: Option<WorkerRequest> = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(second, Some(run));
        let end: Option<WorkerRequest> = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_task_error_crosses_the_wire() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let response = WorkerResponse::Finished {
            task_id: "t".to_string(),
            result: Err(TaskError::Panicked("bad".to_string())),
        };
        write_frame(&mut client, &response, DEFAULT_MAX_FRAME_LEN).await.unwrap();

        let back: Option<WorkerResponse> = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(back, Some(response));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&1_000_000_u32.to_le_bytes()).await.unwrap();

        let result: Result<Option<WorkerRequest>> = read_frame(&mut server, 1024).await;
        assert!(matches!(result, Err(TaskmuxError::Protocol(_))));

        let mut sink = tokio::io::sink();
        let big = WorkerRequest::Run {
            task_id: "t".to_string(),
            job: "echo".to_string(),
            input: vec![0; 2048],
        };
        assert!(write_frame(&mut sink, &big, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10_u32.to_le_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let result: Result<Option<WorkerRequest>> = read_frame(&mut server, 1024).await;
        assert!(matches!(result, Err(TaskmuxError::Protocol(_))));
    }
}
