//! Evaluating `.pmodule` lifecycle modules.
//!
//! ```yaml
//! name: openmw-config
//! desc: Maintains openmw.cfg
//! functions:
//!   add_plugin:
//!     params: [plugin]
//!     set: {last_plugin: "{plugin}"}
//!     write: {/etc/openmw/openmw.cfg: "content={plugin}\n"}
//! ```
//!
//! Writes never touch their target: the rendered content is staged under
//! the config-protect directory for review.

use anyhow::{Context, Result};
use portmod_core::config::env_keys::paths as path_keys;
use portmod_core::protocol::{ModuleCallOutput, ModuleFunctionInfo, ModuleInfo, ShadowFile, WorkerAction};
use portmod_loader::cfg_protect;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::Invocation;

#[derive(Debug, Deserialize)]
struct ModuleDef {
    name: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    functions: BTreeMap<String, FunctionDef>,
}

#[derive(Debug, Deserialize)]
struct FunctionDef {
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    desc: String,
    /// State key → template
    #[serde(default)]
    set: BTreeMap<String, String>,
    /// Absolute target path → template
    #[serde(default)]
    write: BTreeMap<PathBuf, String>,
}

impl ModuleDef {
    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name.clone(),
            desc: self.desc.clone(),
            functions: self
                .functions
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        ModuleFunctionInfo {
                            params: f.params.clone(),
                            desc: f.desc.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

pub(crate) fn run(inv: &Invocation) -> Result<Option<Value>> {
    let def = read_module(&inv.file)?;
    match inv.action {
        WorkerAction::Load => Ok(Some(serde_json::to_value(def.info())?)),
        WorkerAction::Execute => {
            let function = inv.function.as_deref().context("execute requires --module-func")?;
            let cfg_dir = inv
                .env
                .get(path_keys::PORTMOD_CFG_PROTECT_DIR)
                .map(PathBuf::from)
                .context("config-protect directory was not forwarded to the worker")?;
            let state = as_object(inv.init.as_ref(), "--initial-state")?;
            let args = as_object(inv.args.as_ref(), "--args")?;
            let output = call(&def, function, state, &args, &cfg_dir, |p| {
                inv.permissions.can_write(p)
            })?;
            Ok(Some(serde_json::to_value(output)?))
        }
        other => anyhow::bail!("modules have no '{}' action", other),
    }
}

fn read_module(path: &Path) -> Result<ModuleDef> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("Failed to parse module {}", path.display()))
}

fn as_object(value: Option<&Value>, flag: &str) -> Result<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(m)) => Ok(m.clone()),
        Some(_) => anyhow::bail!("{} must be a JSON object", flag),
    }
}

fn call<F>(
    def: &ModuleDef,
    function: &str,
    mut state: Map<String, Value>,
    args: &Map<String, Value>,
    cfg_dir: &Path,
    can_write: F,
) -> Result<ModuleCallOutput>
where
    F: Fn(&Path) -> bool,
{
    let f = def
        .functions
        .get(function)
        .with_context(|| format!("module '{}' has no function '{}'", def.name, function))?;
    if let Some(missing) = f.params.iter().find(|p| !args.contains_key(*p)) {
        anyhow::bail!("function '{}' requires argument '{}'", function, missing);
    }

    // Templates see the state as it was when the call started.
    let before = state.clone();
    for (key, template) in &f.set {
        state.insert(key.clone(), Value::String(render(template, args, &before)?));
    }

    let mut shadow_files = Vec::new();
    for (target, template) in &f.write {
        let content = render(template, args, &before)?;
        let shadow = cfg_protect::shadow_path(cfg_dir, target)?;
        if !can_write(&shadow) {
            anyhow::bail!("not permitted to write {}", shadow.display());
        }
        if let Some(parent) = shadow.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&shadow, content).with_context(|| format!("Failed to write {}", shadow.display()))?;
        tracing::debug!("Staged {} as {}", target.display(), shadow.display());
        shadow_files.push(ShadowFile {
            target: target.clone(),
            shadow,
        });
    }

    Ok(ModuleCallOutput {
        state: Value::Object(state),
        shadow_files,
    })
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)?)\}").expect("valid regex"))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `{param}` from the call arguments and `{state.key}` from the
/// state. Unknown placeholders are an error.
fn render(template: &str, args: &Map<String, Value>, state: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let value = match name.strip_prefix("state.") {
            Some(key) => state.get(key),
            None => args.get(name),
        }
        .with_context(|| format!("unknown placeholder '{{{}}}'", name))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&display(value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MODULE: &str = r#"
name: openmw-config
desc: Maintains openmw.cfg
functions:
  add_plugin:
    params: [plugin]
    desc: Register a plugin
    set:
      last_plugin: "{plugin}"
      previous: "{state.last_plugin}"
    write:
      /etc/openmw/openmw.cfg: "content={plugin}\n"
  noop: {}
"#;

    fn def() -> ModuleDef {
        serde_yaml::from_str(MODULE).unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_info() {
        let info = def().info();
        assert_eq!(info.name, "openmw-config");
        assert_eq!(info.functions["add_plugin"].params, vec!["plugin"]);
        assert!(info.functions["noop"].params.is_empty());
    }

    #[test]
    fn test_render() {
        let args = obj(json!({"plugin": "a.esp", "n": 3}));
        let state = obj(json!({"k": "v"}));
        assert_eq!(render("{plugin}/{n}/{state.k}", &args, &state).unwrap(), "a.esp/3/v");
        assert_eq!(render("no placeholders", &args, &state).unwrap(), "no placeholders");
        assert!(render("{missing}", &args, &state).is_err());
        assert!(render("{state.missing}", &args, &state).is_err());
    }

    #[test]
    fn test_call_sets_state_and_stages_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        let out = call(
            &def(),
            "add_plugin",
            obj(json!({"last_plugin": "old.esp"})),
            &obj(json!({"plugin": "new.esp"})),
            &cfg,
            |p| p.starts_with(&cfg),
        )
        .unwrap();

        assert_eq!(
            out.state,
            json!({"last_plugin": "new.esp", "previous": "old.esp"})
        );
        assert_eq!(out.shadow_files.len(), 1);
        let staged = &out.shadow_files[0];
        assert_eq!(staged.target, PathBuf::from("/etc/openmw/openmw.cfg"));
        assert_eq!(staged.shadow, cfg.join("etc/openmw/openmw.cfg"));
        assert_eq!(fs::read_to_string(&staged.shadow).unwrap(), "content=new.esp\n");
    }

    #[test]
    fn test_call_rejects_bad_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        let d = def();
        assert!(call(&d, "absent", Map::new(), &Map::new(), &cfg, |_| true).is_err());
        assert!(call(&d, "add_plugin", Map::new(), &Map::new(), &cfg, |_| true).is_err());
        let denied = call(
            &d,
            "add_plugin",
            obj(json!({"last_plugin": "y"})),
            &obj(json!({"plugin": "x"})),
            &cfg,
            |_| false,
        );
        assert!(denied.is_err());
        assert!(!cfg.exists());
    }
}
