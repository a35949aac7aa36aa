//! Shared fixtures for loader tests.

use portmod_sandbox::{ExecRequest, Executor, FailureReason, SandboxedError};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Write `<root>/<category>/<name>/<name>-<version>.pybuild`.
pub fn write_definition(root: &Path, category: &str, name: &str, version: &str, content: &str) -> PathBuf {
    let dir = root.join(category).join(name);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}-{}.pybuild", name, version));
    fs::write(&path, content).unwrap();
    path
}

type Handler = dyn Fn(&ExecRequest) -> Result<Option<Value>, SandboxedError> + Send + Sync;

/// Executor that never spawns anything; counts calls and records requests.
pub struct FakeExecutor {
    handler: Box<Handler>,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<ExecRequest>>,
    pub cleared: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<Option<Value>, SandboxedError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `value`.
    pub fn returning(value: Value) -> Self {
        Self::new(move |_| Ok(Some(value.clone())))
    }

    /// Always fails as a worker exiting with code 1.
    pub fn failing() -> Self {
        Self::new(|req| {
            Err(SandboxedError::new(
                req.action,
                req.file.clone(),
                FailureReason::ExitStatus {
                    code: 1,
                    message: "boom".to_string(),
                },
            ))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<Option<Value>, SandboxedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }

    fn clear_state(&self, key: &str) {
        self.cleared.lock().unwrap().push(key.to_string());
    }
}
