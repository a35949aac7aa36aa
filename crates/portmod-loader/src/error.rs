use portmod_core::atom::{AtomError, FQAtom};
use portmod_sandbox::SandboxedError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Cache read/write failures. I/O errors are never swallowed.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("corrupt cache entry {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

/// Everything that can stop a definition from loading.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// An uncached definition was requested from inside a sandboxed worker.
    #[error("cannot load uncached definition {} from inside the sandbox", path.display())]
    LoadFromSandbox { path: PathBuf },

    #[error(transparent)]
    Sandboxed(#[from] SandboxedError),

    /// Replay of a failure already seen this run for the same path.
    #[error("previously failed to load: {0}")]
    PreviouslyEncountered(Box<LoadError>),

    #[error("atom '{atom}' is ambiguous; candidates: {}", format_candidates(candidates))]
    AmbiguousAtom {
        atom: String,
        candidates: Vec<FQAtom>,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{} is not inside any configured repository", path.display())]
    NotInRepository { path: PathBuf },

    #[error(transparent)]
    Atom(#[from] AtomError),

    #[error("worker returned malformed load output for {}: {reason}", path.display())]
    InvalidOutput { path: PathBuf, reason: String },
}

impl LoadError {
    /// The first failure, looking through replays.
    pub fn root_cause(&self) -> &LoadError {
        match self {
            LoadError::PreviouslyEncountered(inner) => inner.root_cause(),
            other => other,
        }
    }
}

fn format_candidates(candidates: &[FQAtom]) -> String {
    candidates
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Module runtime failures.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Sandboxed(#[from] SandboxedError),

    #[error("module {} returned malformed output: {reason}", path.display())]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("module '{module}' has no function '{function}'")]
    UnknownFunction { module: String, function: String },

    #[error("function '{function}' requires argument '{param}'")]
    MissingArgument { function: String, param: String },
}

/// Failures reviewing staged config-protect updates.
#[derive(Debug, Error)]
pub enum CfgProtectError {
    #[error("no pending update for {}", target.display())]
    NoPendingUpdate { target: PathBuf },

    #[error("{} must be an absolute path", target.display())]
    RelativeTarget { target: PathBuf },

    #[error("config-protect I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
