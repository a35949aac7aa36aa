use portmod_core::protocol::WorkerAction;
use std::path::PathBuf;
use thiserror::Error;

/// Why a sandboxed worker invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("could not prepare sandbox: {0}")]
    Setup(String),

    #[error("could not spawn worker: {0}")]
    Spawn(String),

    #[error("worker exited with code {code}: {message}")]
    ExitStatus { code: i32, message: String },

    #[error("worker killed: exceeded timeout of {secs} seconds")]
    TimedOut { secs: u64 },

    #[error("Loading produced no output")]
    NoOutput,

    #[error("worker reported failure: {0}")]
    Reported(String),

    #[error("invalid worker output: {0}")]
    InvalidOutput(String),
}

/// A worker process failed. Only a string summary crosses the process
/// boundary; the worker's own stack stays in its stderr.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sandboxed '{action}' of {} failed: {reason}", file.display())]
pub struct SandboxedError {
    pub action: WorkerAction,
    pub file: PathBuf,
    pub reason: FailureReason,
}

impl SandboxedError {
    pub fn new(action: WorkerAction, file: impl Into<PathBuf>, reason: FailureReason) -> Self {
        Self {
            action,
            file: file.into(),
            reason,
        }
    }
}
