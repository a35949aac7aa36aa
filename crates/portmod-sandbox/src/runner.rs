//! Sandbox executor: runs one worker action in an isolated child process.
//!
//! Callers describe the invocation with an [`ExecRequest`]; the executor
//! augments the request's permissions with its fixed grants, spawns the
//! worker through the configured [`SandboxBackend`], waits (bounded by a
//! timeout) and decodes the worker's JSON envelope.

use crate::common::{stderr_tail, wait_with_timeout};
use crate::error::{FailureReason, SandboxedError};
use crate::info_log;
use crate::sandbox_backend::{select_backend, SandboxBackend};
use anyhow::Context;
use portmod_core::config::env_keys::sandbox as sandbox_keys;
use portmod_core::config::{PathsConfig, SandboxSettings};
use portmod_core::observability;
use portmod_core::permissions::PermissionSet;
use portmod_core::protocol::{encode_env, WorkerAction, WorkerKind, WorkerResponse};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Hidden subcommand the worker binary dispatches on.
pub const WORKER_SUBCOMMAND: &str = "internal-worker";

/// System paths every worker needs to run at all (loader, libc).
const SYSTEM_READ_PATHS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc/ld.so.cache"];

/// One worker invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub kind: WorkerKind,
    /// Absolute path of the artifact to evaluate.
    pub file: PathBuf,
    pub action: WorkerAction,
    pub permissions: PermissionSet,
    /// State threaded into the worker (`--initial-state`).
    pub init: Option<Value>,
    /// Call arguments (`--args`).
    pub args: Option<Value>,
    /// Module function to call (`--module-func`).
    pub function: Option<String>,
    /// Persist a scratch directory under this key between calls (`--state-dir`).
    pub state_key: Option<String>,
}

impl ExecRequest {
    pub fn new(
        kind: WorkerKind,
        file: impl Into<PathBuf>,
        action: WorkerAction,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            kind,
            file: file.into(),
            action,
            permissions,
            init: None,
            args: None,
            function: None,
            state_key: None,
        }
    }

    pub fn with_init(mut self, init: Value) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_saved_state(mut self, key: impl Into<String>) -> Self {
        self.state_key = Some(key.into());
        self
    }

    fn fail(&self, reason: FailureReason) -> SandboxedError {
        SandboxedError::new(self.action, self.file.clone(), reason)
    }
}

/// Seam between the loader and the process machinery.
pub trait Executor: Send + Sync {
    /// Run `request` to completion. `Ok(None)` only for actions that are
    /// allowed to succeed without output.
    fn execute(&self, request: &ExecRequest) -> Result<Option<Value>, SandboxedError>;

    /// Remove the scratch directory saved under `key`, if any.
    fn clear_state(&self, _key: &str) {}
}

/// How to start the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Arguments placed before the worker subcommand.
    pub prefix_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The running binary, re-invoked in worker mode.
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self::new(
            std::env::current_exe().context("Failed to locate the portmod binary")?,
        ))
    }
}

/// Real executor: one child process per call.
pub struct SandboxExecutor {
    backend: Box<dyn SandboxBackend>,
    worker: WorkerCommand,
    repo_roots: Vec<PathBuf>,
    run_tmp: TempDir,
    timeout: Duration,
    verbosity: u8,
    env: BTreeMap<String, String>,
    stream_stderr: bool,
}

impl SandboxExecutor {
    /// `tmp_root` holds the run-wide temp directory, removed on drop.
    pub fn new(
        backend: Box<dyn SandboxBackend>,
        worker: WorkerCommand,
        tmp_root: &Path,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(tmp_root)
            .with_context(|| format!("Failed to create temp root: {}", tmp_root.display()))?;
        let run_tmp = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(tmp_root)
            .context("Failed to create run temp directory")?;
        Ok(Self {
            backend,
            worker,
            repo_roots: Vec::new(),
            run_tmp,
            timeout: Duration::from_secs(portmod_core::config::schema::DEFAULT_TIMEOUT_SECS),
            verbosity: 1,
            env: BTreeMap::new(),
            stream_stderr: true,
        })
    }

    /// Executor configured from the environment.
    pub fn from_config(settings: &SandboxSettings, paths: &PathsConfig) -> anyhow::Result<Self> {
        let backend = select_backend(settings.backend)?;
        let worker = match &settings.worker_bin {
            Some(bin) => WorkerCommand::new(bin),
            None => WorkerCommand::current_exe()?,
        };
        let mut roots: Vec<PathBuf> = paths.repos.iter().map(|r| r.path.clone()).collect();
        roots.push(paths.installed_dir.clone());
        Ok(Self::new(backend, worker, &paths.tmp_dir)?
            .with_repo_roots(roots)
            .with_timeout(Duration::from_secs(settings.timeout_secs))
            .with_env(
                "PORTMOD_CFG_PROTECT_DIR",
                paths.cfg_protect_dir.to_string_lossy(),
            ))
    }

    pub fn with_repo_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.repo_roots.extend(roots.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Extra variable forwarded to workers through `--env`.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stream_stderr(mut self, stream: bool) -> Self {
        self.stream_stderr = stream;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn run_tmp(&self) -> &Path {
        self.run_tmp.path()
    }

    /// Scratch directory for a saved-state key.
    pub fn state_dir(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        self.run_tmp.path().join("state").join(safe)
    }

    /// The request's permissions plus the fixed grants: repository roots and
    /// the worker's installation read-only, a private temp dir read-write.
    pub fn augmented_permissions(&self, request: &ExecRequest) -> PermissionSet {
        let mut read_only: Vec<PathBuf> = self.repo_roots.clone();
        read_only.extend(SYSTEM_READ_PATHS.iter().map(PathBuf::from));
        if let Some(dir) = self.worker.program.parent() {
            if !dir.as_os_str().is_empty() {
                read_only.push(dir.to_path_buf());
            }
        }
        let mut fixed = PermissionSet::new()
            .with_read_only(read_only)
            .with_tmp(self.run_tmp.path().join("work"));
        if let Some(key) = &request.state_key {
            fixed = fixed.with_read_write([self.state_dir(key)]);
        }
        PermissionSet::compose(&request.permissions, [&fixed])
    }

    fn worker_args(
        &self,
        request: &ExecRequest,
        permissions: &PermissionSet,
    ) -> Result<Vec<OsString>, SandboxedError> {
        let env = encode_env(&self.env).map_err(|e| request.fail(FailureReason::Setup(e.to_string())))?;
        let mut args: Vec<OsString> = self.worker.prefix_args.iter().map(OsString::from).collect();
        args.push(WORKER_SUBCOMMAND.into());
        args.push("--verbosity".into());
        args.push(self.verbosity.to_string().into());
        args.push("--env".into());
        args.push(env.into());
        for perm in permissions.to_args() {
            args.push("--permission".into());
            args.push(perm.into());
        }
        if let Some(key) = &request.state_key {
            args.push("--state-dir".into());
            args.push(self.state_dir(key).into());
        }
        if let Some(init) = &request.init {
            args.push("--initial-state".into());
            args.push(init.to_string().into());
        }
        if let Some(call_args) = &request.args {
            args.push("--args".into());
            args.push(call_args.to_string().into());
        }
        if let Some(function) = &request.function {
            args.push("--module-func".into());
            args.push(function.into());
        }
        args.push(request.kind.as_str().into());
        args.push(request.file.clone().into());
        args.push(request.action.as_str().into());
        Ok(args)
    }

    fn prepare_dirs(&self, request: &ExecRequest, permissions: &PermissionSet) -> Result<(), SandboxedError> {
        // bwrap skips bind sources that do not exist, so every writable
        // grant must be present before the worker starts.
        let mut dirs: Vec<PathBuf> = permissions.read_write().into_iter().collect();
        if let Some(tmp) = permissions.tmp() {
            dirs.push(tmp.to_path_buf());
        }
        if let Some(key) = &request.state_key {
            dirs.push(self.state_dir(key));
        }
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| {
                request.fail(FailureReason::Setup(format!("{}: {}", dir.display(), e)))
            })?;
        }
        Ok(())
    }
}

impl Executor for SandboxExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<Option<Value>, SandboxedError> {
        let permissions = self.augmented_permissions(request);
        self.prepare_dirs(request, &permissions)?;
        let args = self.worker_args(request, &permissions)?;
        let env = vec![(sandbox_keys::PORTMOD_SANDBOXED.to_string(), "1".to_string())];

        let mut cmd = self
            .backend
            .command(&self.worker.program, &args, &env, &permissions)
            .map_err(|e| request.fail(FailureReason::Setup(e.to_string())))?;
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let file = request.file.to_string_lossy();
        info_log!(
            kind = %request.kind,
            action = %request.action,
            backend = self.backend.name(),
            "Sandboxed {} of {}",
            request.action,
            file
        );
        observability::audit_sandbox_invoked(
            request.kind.as_str(),
            &file,
            request.action.as_str(),
            self.backend.name(),
        );

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| request.fail(FailureReason::Spawn(e.to_string())))?;
        let outcome = wait_with_timeout(&mut child, self.timeout, self.stream_stderr)
            .map_err(|e| request.fail(FailureReason::Spawn(e.to_string())))?;

        observability::audit_sandbox_completed(
            request.kind.as_str(),
            &file,
            request.action.as_str(),
            outcome.exit_code,
            start.elapsed().as_millis() as u64,
            outcome.timed_out.then_some("timeout"),
        );

        if outcome.timed_out {
            tracing::warn!("Worker for {} exceeded {:?}, killed", file, self.timeout);
            return Err(request.fail(FailureReason::TimedOut {
                secs: self.timeout.as_secs(),
            }));
        }

        let response = WorkerResponse::parse(&outcome.stdout);

        if outcome.exit_code != 0 {
            let message = match response {
                Ok(Some(WorkerResponse { error: Some(err), .. })) => err,
                _ => stderr_tail(&outcome.stderr),
            };
            return Err(request.fail(FailureReason::ExitStatus {
                code: outcome.exit_code,
                message,
            }));
        }

        match response {
            Err(e) => Err(request.fail(FailureReason::InvalidOutput(e.to_string()))),
            Ok(None) if request.action.requires_output() => {
                Err(request.fail(FailureReason::NoOutput))
            }
            Ok(None) => Ok(None),
            Ok(Some(resp)) if !resp.ok => Err(request.fail(FailureReason::Reported(
                resp.error.unwrap_or_else(|| "unknown error".to_string()),
            ))),
            Ok(Some(resp)) => match resp.value {
                None | Some(Value::Null) if request.action.requires_output() => {
                    Err(request.fail(FailureReason::NoOutput))
                }
                value => Ok(value),
            },
        }
    }

    fn clear_state(&self, key: &str) {
        let dir = self.state_dir(key);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!("Failed to remove state dir {}: {}", dir.display(), e);
            }
        }
    }
}
