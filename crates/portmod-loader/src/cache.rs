//! On-disk metadata cache.
//!
//! One JSON file per definition:
//! `{ "fields": {...}, "portmod_version": "...", "hashes": [[file, sha256], ...] }`.
//! An entry is valid only while the tool version and every listed file's
//! hash still match, so editing a shared source invalidates every
//! definition that inherits from it.

use crate::error::CacheError;
use portmod_core::atom::FQAtom;
use portmod_core::hash;
use portmod_core::protocol::LoadOutput;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portmod_version: Option<String>,
    #[serde(default)]
    pub hashes: Vec<(PathBuf, String)>,
}

/// Location of the cache file for `atom`:
/// `<cache_dir>/pybuild/<repo|installed>/<category>/<name-version>.json`.
pub fn cache_path(cache_dir: &Path, atom: &FQAtom) -> PathBuf {
    cache_dir
        .join("pybuild")
        .join(atom.repo())
        .join(atom.category())
        .join(format!("{}.json", atom.pf()))
}

/// Fields on the public definition surface are UPPER_SNAKE_CASE; anything
/// else is worker bookkeeping and never cached.
pub fn is_public_field(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Whether the cache file at `path` can be used by tool `version`.
pub fn cache_valid(path: &Path, version: &str) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(entry) = serde_json::from_str::<CacheEntry>(&content) else {
        tracing::debug!("Cache entry {} is not valid JSON", path.display());
        return false;
    };
    if entry.portmod_version.as_deref() != Some(version) {
        tracing::debug!(
            "Cache entry {} was written by {:?}, running {}",
            path.display(),
            entry.portmod_version,
            version
        );
        return false;
    }
    if entry.hashes.is_empty() {
        return false;
    }
    entry.hashes.iter().all(|(file, expected)| {
        let ok = hash::file_matches(file, expected);
        if !ok {
            tracing::debug!("Cache entry {} stale: {} changed", path.display(), file.display());
        }
        ok
    })
}

fn is_under(path: &Path, dir: &Path) -> bool {
    let canon = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    canon(path).starts_with(canon(dir))
}

/// Serialize a worker's load output into a cache entry.
///
/// With `version` set (caching), the entry is stamped with it and also
/// hashes every inherited source living under `common_dir`; sources
/// elsewhere are treated as stable and skipped. Without it only the
/// definition file is hashed.
pub fn create_cache_str(
    definition: &Path,
    output: &LoadOutput,
    common_dir: Option<&Path>,
    version: Option<&str>,
) -> Result<String, CacheError> {
    let fields: Map<String, Value> = output
        .fields
        .iter()
        .filter(|(k, _)| is_public_field(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut hashes = vec![(
        definition.to_path_buf(),
        hash::hash_file(definition).map_err(|e| CacheError::io(definition, e))?,
    )];
    if version.is_some() {
        if let Some(common) = common_dir {
            for source in &output.sources {
                if !is_under(source, common) {
                    continue;
                }
                if hashes.iter().any(|(p, _)| p == source) {
                    continue;
                }
                let digest = hash::hash_file(source).map_err(|e| CacheError::io(source, e))?;
                hashes.push((source.clone(), digest));
            }
        }
    }

    let entry = CacheEntry {
        fields,
        portmod_version: version.map(String::from),
        hashes,
    };
    serde_json::to_string(&entry).map_err(|e| CacheError::Corrupt {
        path: definition.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write `content` to `path` via a temp file in the same directory and a
/// rename, so readers never observe a partial entry.
pub fn write_cache(path: &Path, content: &str) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| CacheError::io(parent, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

pub fn read_cache(path: &Path) -> Result<CacheEntry, CacheError> {
    let content = fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
