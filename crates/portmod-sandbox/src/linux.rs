#![cfg(target_os = "linux")]

//! Bubblewrap backend.

use crate::sandbox_backend::SandboxBackend;
use anyhow::Result;
use portmod_core::permissions::PermissionSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs workers under `bwrap` with a filesystem view built from the
/// permission set.
#[derive(Debug, Clone)]
pub struct BwrapBackend {
    bwrap: PathBuf,
}

impl BwrapBackend {
    pub fn new(bwrap: impl Into<PathBuf>) -> Self {
        Self {
            bwrap: bwrap.into(),
        }
    }

    /// Locate `bwrap` on PATH.
    pub fn detect() -> Option<Self> {
        which::which("bwrap").ok().map(Self::new)
    }
}

/// bwrap arguments (everything before `--`) enforcing `permissions`.
pub fn bwrap_args(permissions: &PermissionSet, env: &[(String, String)]) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

    push(&["--unshare-all", "--die-with-parent", "--new-session"]);

    if permissions.global_read() {
        push(&["--ro-bind", "/", "/"]);
    } else {
        for path in permissions.effective_read_only() {
            let p = path.to_string_lossy();
            push(&["--ro-bind-try", &p, &p]);
        }
    }

    push(&["--dev", "/dev", "--proc", "/proc"]);

    // Writable binds come last so they win over any read-only parent.
    for path in permissions.read_write() {
        let p = path.to_string_lossy();
        push(&["--bind-try", &p, &p]);
    }

    if permissions.network() {
        push(&["--share-net"]);
    }

    push(&["--clearenv"]);
    if let Ok(path) = std::env::var("PATH") {
        push(&["--setenv", "PATH", &path]);
    }
    for (k, v) in env {
        push(&["--setenv", k, v]);
    }
    if let Some(tmp) = permissions.tmp() {
        let t = tmp.to_string_lossy();
        push(&["--setenv", "TMPDIR", &t, "--setenv", "HOME", &t, "--chdir", &t]);
    }
    args
}

impl SandboxBackend for BwrapBackend {
    fn name(&self) -> &str {
        "bwrap"
    }

    fn command(
        &self,
        program: &Path,
        args: &[OsString],
        env: &[(String, String)],
        permissions: &PermissionSet,
    ) -> Result<Command> {
        let mut cmd = Command::new(&self.bwrap);
        cmd.args(bwrap_args(permissions, env));
        cmd.arg("--");
        cmd.arg(program);
        cmd.args(args);
        Ok(cmd)
    }
}
