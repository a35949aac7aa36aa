//! The sandboxed side of the controller/worker split.
//!
//! Runs inside the sandbox, evaluates one artifact, prints exactly one
//! response envelope on stdout and exits. Failures are reported both in the
//! envelope and through a nonzero exit code.

mod module;
mod pybuild;

use anyhow::{Context, Result};
use portmod_core::permissions::PermissionSet;
use portmod_core::protocol::{decode_env, WorkerAction, WorkerKind, WorkerResponse};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use crate::cli::WorkerArgs;

/// Everything the controller handed over, decoded.
pub(crate) struct Invocation {
    pub kind: WorkerKind,
    pub file: PathBuf,
    pub action: WorkerAction,
    pub env: BTreeMap<String, String>,
    pub permissions: PermissionSet,
    pub state_dir: Option<PathBuf>,
    pub init: Option<Value>,
    pub args: Option<Value>,
    pub function: Option<String>,
}

impl Invocation {
    fn from_args(args: &WorkerArgs) -> Result<Self> {
        let parse_json = |raw: &Option<String>, flag: &str| -> Result<Option<Value>> {
            raw.as_deref()
                .map(|s| serde_json::from_str(s).with_context(|| format!("{} is not valid JSON", flag)))
                .transpose()
        };
        Ok(Self {
            kind: args.kind.parse()?,
            file: args.file.clone(),
            action: args.action.parse()?,
            env: match &args.env {
                Some(encoded) => decode_env(encoded)?,
                None => BTreeMap::new(),
            },
            permissions: PermissionSet::from_args(&args.permissions).map_err(anyhow::Error::msg)?,
            state_dir: args.state_dir.clone(),
            init: parse_json(&args.initial_state, "--initial-state")?,
            args: parse_json(&args.args, "--args")?,
            function: args.module_func.clone(),
        })
    }
}

fn evaluate(args: &WorkerArgs) -> Result<Option<Value>> {
    let inv = Invocation::from_args(args)?;
    tracing::debug!("Worker: {} {} {}", inv.kind, inv.action, inv.file.display());
    match inv.kind {
        WorkerKind::Pybuild => pybuild::run(&inv),
        WorkerKind::Module => module::run(&inv),
    }
}

fn emit(response: &WorkerResponse) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, response)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Worker entry point.
pub fn run(args: &WorkerArgs) -> Result<()> {
    match evaluate(args) {
        Ok(Some(value)) => emit(&WorkerResponse::success(value)),
        Ok(None) => Ok(()),
        Err(e) => {
            emit(&WorkerResponse::failure(format!("{:#}", e)))?;
            Err(e)
        }
    }
}
