//! Controller ↔ worker wire types.
//!
//! These are the only values that cross the sandbox boundary. The worker
//! prints exactly one [`WorkerResponse`] to stdout; everything else it says
//! goes to stderr.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Bumped whenever the envelope or payload shapes change incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// What kind of artifact the worker evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Pybuild,
    Module,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Pybuild => "pybuild",
            WorkerKind::Module => "module",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pybuild" => Ok(WorkerKind::Pybuild),
            "module" => Ok(WorkerKind::Module),
            other => anyhow::bail!("unknown worker kind: {}", other),
        }
    }
}

/// Verb the worker performs on the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerAction {
    Load,
    Execute,
    CanUpdateLive,
    DumpEnvironment,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerAction::Load => "load",
            WorkerAction::Execute => "execute",
            WorkerAction::CanUpdateLive => "can-update-live",
            WorkerAction::DumpEnvironment => "dump-environment",
        }
    }

    /// Actions whose success requires a payload on stdout.
    pub fn requires_output(&self) -> bool {
        matches!(self, WorkerAction::Load)
    }
}

impl fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "load" => Ok(WorkerAction::Load),
            "execute" => Ok(WorkerAction::Execute),
            "can-update-live" => Ok(WorkerAction::CanUpdateLive),
            "dump-environment" => Ok(WorkerAction::DumpEnvironment),
            other => anyhow::bail!("unknown worker action: {}", other),
        }
    }
}

/// Envelope printed by the worker: `{version, ok, value | error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub version: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn success(value: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Parse the worker's stdout. Blank output yields `None`.
    pub fn parse(stdout: &str) -> Result<Option<Self>> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let resp: WorkerResponse = serde_json::from_str(trimmed)
            .with_context(|| format!("worker output is not a valid response: {}", trimmed))?;
        if resp.version != PROTOCOL_VERSION {
            anyhow::bail!(
                "worker protocol version {} does not match controller version {}",
                resp.version,
                PROTOCOL_VERSION
            );
        }
        Ok(Some(resp))
    }
}

/// Payload of a successful pybuild `load`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOutput {
    /// Every field the definition (and its ancestors) produced.
    pub fields: Map<String, Value>,
    /// Shared source files the definition inherits from, in resolution order.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

/// One callable function declared by a lifecycle module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFunctionInfo {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub desc: String,
}

/// Payload of a module `load`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub functions: BTreeMap<String, ModuleFunctionInfo>,
}

/// Pending change to a real system file, staged under config-protect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowFile {
    /// File the change is meant for.
    pub target: PathBuf,
    /// Staged copy awaiting review.
    pub shadow: PathBuf,
}

/// Payload of a module `execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleCallOutput {
    pub state: Value,
    #[serde(default)]
    pub shadow_files: Vec<ShadowFile>,
}

/// Encode the environment handed to a worker (`--env`): hex of JSON.
pub fn encode_env(env: &BTreeMap<String, String>) -> Result<String> {
    Ok(hex::encode(serde_json::to_vec(env)?))
}

pub fn decode_env(encoded: &str) -> Result<BTreeMap<String, String>> {
    let bytes = hex::decode(encoded.trim()).context("--env is not valid hex")?;
    serde_json::from_slice(&bytes).context("--env does not hold a JSON object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(WorkerResponse::success(json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"version": 1, "ok": true, "value": {"a": 1}}));
        let err = serde_json::to_value(WorkerResponse::failure("boom")).unwrap();
        assert_eq!(err, json!({"version": 1, "ok": false, "error": "boom"}));
    }

    #[test]
    fn test_parse_blank_and_garbage() {
        assert!(WorkerResponse::parse("  \n").unwrap().is_none());
        assert!(WorkerResponse::parse("not json").is_err());
        assert!(WorkerResponse::parse(r#"{"version": 99, "ok": true}"#).is_err());
        let resp = WorkerResponse::parse(r#"{"version":1,"ok":false,"error":"x"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(resp.error.as_deref(), Some("x"));
    }

    #[test]
    fn test_action_names() {
        for action in [
            WorkerAction::Load,
            WorkerAction::Execute,
            WorkerAction::CanUpdateLive,
            WorkerAction::DumpEnvironment,
        ] {
            assert_eq!(action.as_str().parse::<WorkerAction>().unwrap(), action);
        }
        assert!("install".parse::<WorkerAction>().is_err());
    }

    #[test]
    fn test_env_encoding() {
        let mut env = BTreeMap::new();
        env.insert("PORTMOD_CFG_PROTECT_DIR".to_string(), "/cfg".to_string());
        let encoded = encode_env(&env).unwrap();
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decode_env(&encoded).unwrap(), env);
        assert!(decode_env("zz").is_err());
    }
}
