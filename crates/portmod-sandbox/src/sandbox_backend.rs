//! SandboxBackend trait: extension point for isolation technologies.
//!
//! A backend turns "run this worker under this permission set" into a
//! concrete [`Command`]. The executor owns spawning, waiting and result
//! decoding, so backends stay small.

use anyhow::Result;
use portmod_core::config::SandboxBackendKind;
use portmod_core::permissions::PermissionSet;
use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

/// Extension point for sandbox execution backends.
pub trait SandboxBackend: Send + Sync {
    /// Backend name for logging and audit.
    fn name(&self) -> &str;

    /// Build the command running `program args` confined to `permissions`,
    /// with exactly `env` as its environment.
    fn command(
        &self,
        program: &Path,
        args: &[OsString],
        env: &[(String, String)],
        permissions: &PermissionSet,
    ) -> Result<Command>;
}

/// Runs the worker directly. Permissions are handed to the worker but not
/// enforced by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsandboxedBackend;

impl SandboxBackend for UnsandboxedBackend {
    fn name(&self) -> &str {
        "none"
    }

    fn command(
        &self,
        program: &Path,
        args: &[OsString],
        env: &[(String, String)],
        permissions: &PermissionSet,
    ) -> Result<Command> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(tmp) = permissions.tmp() {
            cmd.env("TMPDIR", tmp);
            cmd.env("HOME", tmp);
            cmd.current_dir(tmp);
        }
        Ok(cmd)
    }
}

/// Pick the backend for `kind`.
///
/// `Auto` prefers bubblewrap; when none is available it fails rather than
/// silently running unconfined. Set `PORTMOD_NO_SANDBOX=1` to opt out.
pub fn select_backend(kind: SandboxBackendKind) -> Result<Box<dyn SandboxBackend>> {
    match kind {
        SandboxBackendKind::None => {
            tracing::warn!("Sandbox disabled - workers run without filesystem isolation");
            Ok(Box::new(UnsandboxedBackend))
        }
        SandboxBackendKind::Bwrap | SandboxBackendKind::Auto => native_backend(kind),
    }
}

#[cfg(target_os = "linux")]
fn native_backend(kind: SandboxBackendKind) -> Result<Box<dyn SandboxBackend>> {
    match crate::linux::BwrapBackend::detect() {
        Some(backend) => Ok(Box::new(backend)),
        None => anyhow::bail!(
            "No sandbox tool available ({:?} backend requested). Install bubblewrap (bwrap) or set PORTMOD_NO_SANDBOX=1 to run without sandbox (not recommended).",
            kind
        ),
    }
}

#[cfg(not(target_os = "linux"))]
fn native_backend(kind: SandboxBackendKind) -> Result<Box<dyn SandboxBackend>> {
    anyhow::bail!(
        "{:?} sandbox backend is only supported on Linux. Set PORTMOD_NO_SANDBOX=1 to run without sandbox (not recommended).",
        kind
    )
}
