//! Worker process for the taskmux process backend.
//!
//! Speaks the length-prefixed bincode protocol on stdin/stdout and runs the
//! built-in jobs. Not meant to be started by hand: the executor spawns one
//! per lane.
//!
//! Besides the built-ins it knows `crash`, which aborts the process and is
//! used to exercise worker restarts.

use taskmux::error::Result;
use taskmux::job::JobRegistry;
use tracing::error;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries frames; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .init();

    let mut registry = JobRegistry::builtin();
    registry.register_blocking("crash", |_, _| std::process::abort());

    taskmux::worker::serve(registry)
        .await
        .map_err(|e| {
            error!("Worker stopped: {e}");
            e
        })
}
