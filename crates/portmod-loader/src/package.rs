use crate::cache::CacheEntry;
use portmod_core::atom::FQAtom;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// One loaded package definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    atom: FQAtom,
    file: PathBuf,
    installed: bool,
    fields: Map<String, Value>,
}

impl Package {
    pub fn new(atom: FQAtom, file: impl Into<PathBuf>, installed: bool, fields: Map<String, Value>) -> Self {
        Self {
            atom,
            file: file.into(),
            installed,
            fields,
        }
    }

    pub(crate) fn from_entry(atom: FQAtom, file: &Path, installed: bool, entry: CacheEntry) -> Self {
        Self::new(atom, file, installed, entry.fields)
    }

    pub fn atom(&self) -> &FQAtom {
        &self.atom
    }

    /// Definition file backing this package.
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// `NAME`, falling back to the atom's package name.
    pub fn name(&self) -> &str {
        self.get_str("NAME").unwrap_or_else(|| self.atom.name())
    }

    pub fn desc(&self) -> &str {
        self.get_str("DESC").unwrap_or_default()
    }

    /// Space-separated or list-valued field as a list of words.
    pub fn words(&self, field: &str) -> Vec<String> {
        match self.fields.get(field) {
            Some(Value::String(s)) => s.split_whitespace().map(String::from).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
