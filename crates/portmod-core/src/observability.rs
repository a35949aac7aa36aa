//! Observability: tracing init and the JSONL audit log.
//!
//! Log output always goes to stderr. Worker stdout is the result channel and
//! must stay clean.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;

static AUDIT_PATH: Mutex<Option<String>> = Mutex::new(None);

/// Tracing initialization mode.
#[derive(Clone, Copy, Debug)]
pub enum TracingMode {
    /// Controller: PORTMOD_LOG_LEVEL / PORTMOD_QUIET from env
    Default,
    /// Worker: level forwarded by the controller via `--verbosity`
    Worker { verbosity: u8 },
}

/// Map a numeric verbosity (0 = warn .. 3 = trace) to a filter directive.
pub fn verbosity_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "portmod=warn",
        1 => "portmod=info",
        2 => "portmod=debug",
        _ => "portmod=trace",
    }
}

/// Initialize tracing. Call once at process startup.
pub fn init_tracing(mode: TracingMode) {
    let cfg = ObservabilityConfig::from_env();
    let level: String = match mode {
        TracingMode::Worker { verbosity } => verbosity_directive(verbosity).to_string(),
        TracingMode::Default if cfg.quiet => "portmod=warn".to_string(),
        TracingMode::Default => cfg.log_level.clone(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let _ = if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()
    };
}

fn get_audit_path() -> Option<String> {
    {
        let guard = AUDIT_PATH.lock().ok()?;
        if let Some(ref p) = *guard {
            return Some(p.clone());
        }
    }
    let path = ObservabilityConfig::from_env().audit_log.clone()?;
    if let Some(parent) = Path::new(&path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    {
        let mut guard = AUDIT_PATH.lock().ok()?;
        *guard = Some(path.clone());
    }
    Some(path)
}

fn append_jsonl(path: &str, record: &serde_json::Value) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(f, "{}", line);
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Audit: a worker is about to be spawned.
pub fn audit_sandbox_invoked(kind: &str, file: &str, action: &str, backend: &str) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now(),
            "event": "sandbox_invoked",
            "kind": kind,
            "file": file,
            "action": action,
            "backend": backend,
        });
        append_jsonl(&path, &record);
    }
}

/// Audit: a worker exited (or was killed).
pub fn audit_sandbox_completed(
    kind: &str,
    file: &str,
    action: &str,
    exit_code: i32,
    duration_ms: u64,
    killed: Option<&str>,
) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now(),
            "event": "sandbox_completed",
            "kind": kind,
            "file": file,
            "action": action,
            "exit_code": exit_code,
            "duration_ms": duration_ms,
            "killed": killed,
        });
        append_jsonl(&path, &record);
    }
}

/// Audit: a staged config-protect change was accepted or discarded.
pub fn audit_cfg_protect(target: &str, accepted: bool) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now(),
            "event": "cfg_protect",
            "target": target,
            "accepted": accepted,
        });
        append_jsonl(&path, &record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_directive() {
        assert_eq!(verbosity_directive(0), "portmod=warn");
        assert_eq!(verbosity_directive(2), "portmod=debug");
        assert_eq!(verbosity_directive(9), "portmod=trace");
    }

    #[test]
    fn test_append_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let p = path.to_string_lossy().to_string();
        append_jsonl(&p, &json!({"event": "a"}));
        append_jsonl(&p, &json!({"event": "b"}));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
