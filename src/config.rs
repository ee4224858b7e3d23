//! Executor configuration.
//!
//! Everything has a default; [`ExecutorConfig::from_env`] applies
//! `TASKMUX_*` overrides on top of it.

use crate::error::{Result, TaskmuxError};
use crate::wire::DEFAULT_MAX_FRAME_LEN;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the worker binary, without platform suffix.
pub const WORKER_BIN_NAME: &str = "taskmux-worker";

/// Default time a worker process gets to send its ready message.
pub const DEFAULT_WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by every batch an [`Executor`](crate::executor::Executor) runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Reject CPU-bound tasks on backends without CPU parallelism instead
    /// of only warning.
    pub strict_cpu_parallelism: bool,
    /// Worker binary for the process backend. Located automatically when unset.
    pub worker_program: Option<PathBuf>,
    /// How long a new worker process may take to report ready.
    pub worker_startup_timeout: Duration,
    /// Largest frame accepted on the worker channel.
    pub max_frame_len: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            strict_cpu_parallelism: false,
            worker_program: None,
            worker_startup_timeout: DEFAULT_WORKER_STARTUP_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ExecutorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with `TASKMUX_*` environment overrides.
    ///
    /// | variable                    | field                    |
    /// |-----------------------------|--------------------------|
    /// | `TASKMUX_STRICT`            | `strict_cpu_parallelism` |
    /// | `TASKMUX_WORKER`            | `worker_program`         |
    /// | `TASKMUX_WORKER_STARTUP_MS` | `worker_startup_timeout` |
    /// | `TASKMUX_MAX_FRAME_BYTES`   | `max_frame_len`          |
    ///
    /// Values that do not parse are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(strict) = std::env::var("TASKMUX_STRICT") {
            if let Some(v) = parse_bool(&strict) {
                self.strict_cpu_parallelism = v;
            }
        }

        if let Ok(program) = std::env::var("TASKMUX_WORKER") {
            if !program.is_empty() {
                self.worker_program = Some(PathBuf::from(program));
            }
        }

        if let Ok(ms) = std::env::var("TASKMUX_WORKER_STARTUP_MS") {
            if let Ok(v) = ms.parse() {
                self.worker_startup_timeout = Duration::from_millis(v);
            }
        }

        if let Ok(bytes) = std::env::var("TASKMUX_MAX_FRAME_BYTES") {
            if let Ok(v) = bytes.parse() {
                self.max_frame_len = v;
            }
        }
    }

    /// Sets strict CPU-parallelism checking.
    #[must_use]
    pub const fn strict_cpu_parallelism(mut self, strict: bool) -> Self {
        self.strict_cpu_parallelism = strict;
        self
    }

    /// Sets the worker binary.
    #[must_use]
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Sets the worker startup timeout.
    #[must_use]
    pub const fn worker_startup_timeout(mut self, timeout: Duration) -> Self {
        self.worker_startup_timeout = timeout;
        self
    }

    /// Sets the frame size limit.
    #[must_use]
    pub const fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Finds the worker binary.
    ///
    /// Uses `worker_program` when set, otherwise looks for `taskmux-worker`
    /// next to the running executable and then in its parent directory
    /// (where cargo puts binaries relative to test executables).
    ///
    /// # Errors
    ///
    /// Returns [`TaskmuxError::WorkerStartup`] if no candidate exists.
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }

        let file_name = format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);
        let exe = std::env::current_exe()?;
        let candidates = exe
            .parent()
            .into_iter()
            .flat_map(|dir| [Some(dir), dir.parent()])
            .flatten()
            .map(|dir| dir.join(&file_name));

        for candidate in candidates {
            if is_file(&candidate) {
                debug!("Resolved worker binary: {}", candidate.display());
                return Ok(candidate);
            }
        }

        Err(TaskmuxError::WorkerStartup {
            program: PathBuf::from(file_name),
            reason: "binary not found next to the current executable; set TASKMUX_WORKER"
                .to_string(),
        })
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
