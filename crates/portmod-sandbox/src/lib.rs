pub mod common;
pub mod error;
pub mod log;
pub mod runner;
pub mod sandbox_backend;

#[cfg(target_os = "linux")]
pub mod linux;

pub use error::{FailureReason, SandboxedError};
pub use runner::{ExecRequest, Executor, SandboxExecutor, WorkerCommand};
pub use sandbox_backend::{select_backend, SandboxBackend, UnsandboxedBackend};
