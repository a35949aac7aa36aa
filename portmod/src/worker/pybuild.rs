//! Evaluating `.pybuild` definitions.
//!
//! A definition is a YAML mapping of fields. `inherit:` names shared
//! sources under the repository's `common/` directory; they are applied in
//! order, each after its own ancestors, and the definition overrides them
//! all.

use anyhow::{Context, Result};
use portmod_core::protocol::{LoadOutput, WorkerAction};
use serde_json::{Map, Number, Value};
use serde_yaml::{Mapping, Value as Yaml};
use std::fs;
use std::path::{Path, PathBuf};

use super::Invocation;

const INHERIT_KEY: &str = "inherit";
const COMMON_EXT: &str = "yaml";
const ENVIRONMENT_FILE: &str = "environment.json";

pub(crate) fn run(inv: &Invocation) -> Result<Option<Value>> {
    match inv.action {
        WorkerAction::Load => {
            let output = load_definition(&inv.file)?;
            Ok(Some(serde_json::to_value(output)?))
        }
        WorkerAction::CanUpdateLive => {
            let fields = fields_of(inv)?;
            Ok(Some(Value::Bool(is_live(&fields))))
        }
        WorkerAction::DumpEnvironment => {
            let dir = inv
                .state_dir
                .as_deref()
                .context("dump-environment requires --state-dir")?;
            let fields = fields_of(inv)?;
            let target = dir.join(ENVIRONMENT_FILE);
            fs::write(&target, serde_json::to_string_pretty(&fields)?)
                .with_context(|| format!("Failed to write {}", target.display()))?;
            tracing::debug!("Wrote environment to {}", target.display());
            Ok(None)
        }
        WorkerAction::Execute => anyhow::bail!("definitions have no '{}' action", inv.action),
    }
}

/// Fields handed over by the controller, or freshly evaluated.
fn fields_of(inv: &Invocation) -> Result<Map<String, Value>> {
    match &inv.init {
        Some(Value::Object(fields)) => Ok(fields.clone()),
        Some(_) => anyhow::bail!("--initial-state must be a JSON object"),
        None => Ok(load_definition(&inv.file)?.fields),
    }
}

fn is_live(fields: &Map<String, Value>) -> bool {
    match fields.get("PROPERTIES") {
        Some(Value::String(s)) => s.split_whitespace().any(|w| w == "live"),
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some("live")),
        _ => false,
    }
}

/// `<root>/<category>/<name>/<file>` → `<root>/common`
fn common_dir_for(file: &Path) -> Option<PathBuf> {
    Some(file.parent()?.parent()?.parent()?.join("common"))
}

pub(crate) fn load_definition(file: &Path) -> Result<LoadOutput> {
    let doc = read_mapping(file)?;
    let mut fields = Map::new();
    let mut sources = Vec::new();

    let parents = inherit_list(&doc, file)?;
    if !parents.is_empty() {
        let common = common_dir_for(file)
            .with_context(|| format!("{} is not inside a repository", file.display()))?;
        let mut stack = Vec::new();
        for parent in &parents {
            fields.extend(resolve(&common, parent, &mut stack, &mut sources)?);
        }
    }
    fields.extend(to_fields(doc, file)?);
    fields.insert("FILE".to_string(), Value::String(file.to_string_lossy().into_owned()));

    Ok(LoadOutput { fields, sources })
}

fn resolve(
    common: &Path,
    name: &str,
    stack: &mut Vec<PathBuf>,
    sources: &mut Vec<PathBuf>,
) -> Result<Map<String, Value>> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        anyhow::bail!("invalid inherited source name '{}'", name);
    }
    let path = common.join(format!("{}.{}", name, COMMON_EXT));
    if stack.contains(&path) {
        let chain: Vec<String> = stack.iter().map(|p| p.display().to_string()).collect();
        anyhow::bail!(
            "inheritance cycle: {} -> {}",
            chain.join(" -> "),
            path.display()
        );
    }
    let doc = read_mapping(&path)?;
    stack.push(path.clone());
    let mut fields = Map::new();
    for parent in inherit_list(&doc, &path)? {
        fields.extend(resolve(common, &parent, stack, sources)?);
    }
    fields.extend(to_fields(doc, &path)?);
    stack.pop();
    if !sources.contains(&path) {
        sources.push(path);
    }
    Ok(fields)
}

fn read_mapping(path: &Path) -> Result<Mapping> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let doc: Yaml =
        serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    match doc {
        Yaml::Null => Ok(Mapping::new()),
        Yaml::Mapping(m) => Ok(m),
        _ => anyhow::bail!("{} must be a mapping of fields", path.display()),
    }
}

fn inherit_list(doc: &Mapping, path: &Path) -> Result<Vec<String>> {
    match doc.get(INHERIT_KEY) {
        None | Some(Yaml::Null) => Ok(Vec::new()),
        Some(Yaml::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(Yaml::Sequence(items)) => items
            .iter()
            .map(|item| match item {
                Yaml::String(s) => Ok(s.clone()),
                _ => anyhow::bail!("{}: inherit entries must be names", path.display()),
            })
            .collect(),
        Some(_) => anyhow::bail!("{}: inherit must be a list of names", path.display()),
    }
}

fn to_fields(doc: Mapping, path: &Path) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for (key, value) in doc {
        let Yaml::String(key) = key else {
            anyhow::bail!("{}: field names must be strings", path.display());
        };
        if key == INHERIT_KEY {
            continue;
        }
        fields.insert(key, to_json(value));
    }
    Ok(fields)
}

fn is_set_tag(tag: &str) -> bool {
    let bare = tag.trim_start_matches('!');
    bare == "set" || bare.ends_with(":set")
}

/// YAML → JSON. `!set` becomes a sorted list without duplicates, a tagged
/// mapping becomes its mapping, any other tagged value its string form.
pub(crate) fn to_json(value: Yaml) -> Value {
    match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(n.to_string()))
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => Value::Array(items.into_iter().map(to_json).collect()),
        Yaml::Mapping(m) => Value::Object(
            m.into_iter()
                .map(|(k, v)| (scalar_string(k), to_json(v)))
                .collect(),
        ),
        Yaml::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            if is_set_tag(&tag) {
                let members: Vec<Yaml> = match tagged.value {
                    Yaml::Sequence(items) => items,
                    Yaml::Mapping(m) => m.into_iter().map(|(k, _)| k).collect(),
                    other => vec![other],
                };
                let mut keyed: Vec<(String, Value)> = members
                    .into_iter()
                    .map(to_json)
                    .map(|v| (sort_key(&v), v))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                keyed.dedup_by(|a, b| a.0 == b.0);
                Value::Array(keyed.into_iter().map(|(_, v)| v).collect())
            } else {
                match tagged.value {
                    m @ Yaml::Mapping(_) => to_json(m),
                    other => Value::String(scalar_string(other)),
                }
            }
        }
    }
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn scalar_string(value: Yaml) -> String {
    match value {
        Yaml::String(s) => s,
        Yaml::Null => String::new(),
        Yaml::Bool(b) => b.to_string(),
        Yaml::Number(n) => n.to_string(),
        other => sort_key(&to_json(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Repo {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Repo {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            fs::create_dir_all(root.join("common")).unwrap();
            Self { _tmp: tmp, root }
        }

        fn common(&self, name: &str, content: &str) -> PathBuf {
            let path = self.root.join("common").join(format!("{}.yaml", name));
            fs::write(&path, content).unwrap();
            path
        }

        fn definition(&self, content: &str) -> PathBuf {
            let dir = self.root.join("foo/bar");
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join("bar-1.0.pybuild");
            fs::write(&path, content).unwrap();
            path
        }
    }

    #[test]
    fn test_inheritance_order_and_sources() {
        let repo = Repo::new();
        let root = repo.common("root", "KEYWORDS: base\nLICENSE: GPL-3\n");
        let mw = repo.common("mw", "inherit: root\nKEYWORDS: openmw\nTEXTURES: 512\n");
        let extra = repo.common("extra", "TEXTURES: 1024\n");
        let file = repo.definition("inherit: [mw, extra]\nNAME: Bar\n");

        let out = load_definition(&file).unwrap();
        assert_eq!(out.sources, vec![root, mw, extra]);
        assert_eq!(out.fields["KEYWORDS"], json!("openmw"));
        assert_eq!(out.fields["LICENSE"], json!("GPL-3"));
        assert_eq!(out.fields["TEXTURES"], json!(1024));
        assert_eq!(out.fields["NAME"], json!("Bar"));
        assert_eq!(out.fields["FILE"], json!(file.to_string_lossy()));
        assert!(!out.fields.contains_key("inherit"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let repo = Repo::new();
        repo.common("a", "inherit: b\n");
        repo.common("b", "inherit: a\n");
        let file = repo.definition("inherit: a\n");
        let err = load_definition(&file).unwrap_err();
        assert!(format!("{:#}", err).contains("inheritance cycle"));
    }

    #[test]
    fn test_missing_parent_and_bad_shapes() {
        let repo = Repo::new();
        let file = repo.definition("inherit: [absent]\n");
        assert!(load_definition(&file).is_err());

        let file = repo.definition("- just\n- a list\n");
        assert!(load_definition(&file).is_err());

        let file = repo.definition("inherit: ../escape\n");
        assert!(load_definition(&file).is_err());

        let file = repo.definition("");
        let out = load_definition(&file).unwrap();
        assert_eq!(out.fields.len(), 1);
        assert!(out.sources.is_empty());
    }

    #[test]
    fn test_value_conversion() {
        let repo = Repo::new();
        let file = repo.definition(
            "IUSE: !set [zeta, alpha, zeta]\n\
             SRC: !source {url: 'https://example.org/a.zip', size: 3}\n\
             VERSION_HINT: !version 1.2\n\
             RATIO: 0.5\n\
             FLAGS: {1: one}\n",
        );
        let out = load_definition(&file).unwrap();
        assert_eq!(out.fields["IUSE"], json!(["alpha", "zeta"]));
        assert_eq!(
            out.fields["SRC"],
            json!({"url": "https://example.org/a.zip", "size": 3})
        );
        assert_eq!(out.fields["VERSION_HINT"], json!("1.2"));
        assert_eq!(out.fields["RATIO"], json!(0.5));
        assert_eq!(out.fields["FLAGS"], json!({"1": "one"}));
    }

    #[test]
    fn test_live_detection() {
        let live = json!({"PROPERTIES": "live"});
        let list = json!({"PROPERTIES": ["interactive", "live"]});
        let plain = json!({"NAME": "x"});
        assert!(is_live(live.as_object().unwrap()));
        assert!(is_live(list.as_object().unwrap()));
        assert!(!is_live(plain.as_object().unwrap()));
    }
}
