//! Package atoms: `[category/]name[-version[-rN]][::repo]`.
//!
//! An [`FQAtom`] carries every component and is what the loader keys
//! packages by. Both types print back to the exact form they parse from.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Pseudo-repository name for the installed package database.
pub const INSTALLED_REPO: &str = "installed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtomError {
    #[error("invalid atom: {0}")]
    Invalid(String),

    #[error("atom '{atom}' is not fully qualified (missing {missing})")]
    NotQualified { atom: String, missing: &'static str },
}

fn atom_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<cat>[A-Za-z0-9_][A-Za-z0-9+_.-]*)/)?(?P<name>[A-Za-z0-9_][A-Za-z0-9+_-]*?)(?:-(?P<ver>[0-9]+(?:\.[0-9]+)*[a-z]?(?:_(?:alpha|beta|pre|rc|p)[0-9]*)*)(?:-r(?P<rev>[0-9]+))?)?(?:::(?P<repo>[A-Za-z0-9_][A-Za-z0-9_-]*))?$",
        )
        .expect("atom regex is valid")
    })
}

/// A (possibly partial) package identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom {
    pub category: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub revision: Option<u32>,
    pub repo: Option<String>,
}

impl Atom {
    pub fn parse(input: &str) -> Result<Self, AtomError> {
        let caps = atom_regex()
            .captures(input.trim())
            .ok_or_else(|| AtomError::Invalid(input.to_string()))?;
        let revision = match caps.name("rev") {
            Some(m) => Some(
                m.as_str()
                    .parse::<u32>()
                    .map_err(|_| AtomError::Invalid(input.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            category: caps.name("cat").map(|m| m.as_str().to_string()),
            name: caps["name"].to_string(),
            version: caps.name("ver").map(|m| m.as_str().to_string()),
            revision,
            repo: caps.name("repo").map(|m| m.as_str().to_string()),
        })
    }

    /// Version including the revision suffix, e.g. `1.0-r2`.
    pub fn full_version(&self) -> Option<String> {
        self.version.as_ref().map(|v| match self.revision {
            Some(r) => format!("{}-r{}", v, r),
            None => v.clone(),
        })
    }

    /// `name-version[-rN]`, or just the name when unversioned.
    pub fn pf(&self) -> String {
        match self.full_version() {
            Some(v) => format!("{}-{}", self.name, v),
            None => self.name.clone(),
        }
    }

    /// `category/name` (or just the name when there is no category).
    pub fn cpn(&self) -> String {
        match &self.category {
            Some(c) => format!("{}/{}", c, self.name),
            None => self.name.clone(),
        }
    }

    /// Whether this (possibly partial) atom selects `fq`.
    pub fn matches(&self, fq: &FQAtom) -> bool {
        let other = fq.as_atom();
        if self.name != other.name {
            return false;
        }
        if self.category.is_some() && self.category != other.category {
            return false;
        }
        if self.version.is_some()
            && (self.version != other.version
                || (self.revision.is_some() && self.revision != other.revision))
        {
            return false;
        }
        if self.repo.is_some() && self.repo != other.repo {
            return false;
        }
        true
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(c) = &self.category {
            write!(f, "{}/", c)?;
        }
        write!(f, "{}", self.pf())?;
        if let Some(r) = &self.repo {
            write!(f, "::{}", r)?;
        }
        Ok(())
    }
}

impl FromStr for Atom {
    type Err = AtomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fully qualified atom: category, version and repository all present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FQAtom(Atom);

impl FQAtom {
    pub fn parse(input: &str) -> Result<Self, AtomError> {
        Self::try_from(Atom::parse(input)?)
    }

    /// Build from repository layout components: `category`, the definition
    /// file stem (`name-version`) and the repository name.
    pub fn from_parts(category: &str, pf: &str, repo: &str) -> Result<Self, AtomError> {
        Self::parse(&format!("{}/{}::{}", category, pf, repo))
    }

    pub fn as_atom(&self) -> &Atom {
        &self.0
    }

    pub fn category(&self) -> &str {
        self.0.category.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn repo(&self) -> &str {
        self.0.repo.as_deref().unwrap_or_default()
    }

    pub fn pf(&self) -> String {
        self.0.pf()
    }

    pub fn cpn(&self) -> String {
        self.0.cpn()
    }

    pub fn is_installed(&self) -> bool {
        self.repo() == INSTALLED_REPO
    }
}

impl TryFrom<Atom> for FQAtom {
    type Error = AtomError;

    fn try_from(atom: Atom) -> Result<Self, Self::Error> {
        let missing = if atom.category.is_none() {
            Some("category")
        } else if atom.version.is_none() {
            Some("version")
        } else if atom.repo.is_none() {
            Some("repository")
        } else {
            None
        };
        match missing {
            Some(missing) => Err(AtomError::NotQualified {
                atom: atom.to_string(),
                missing,
            }),
            None => Ok(Self(atom)),
        }
    }
}

impl TryFrom<String> for FQAtom {
    type Error = AtomError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FQAtom> for String {
    fn from(fq: FQAtom) -> Self {
        fq.to_string()
    }
}

impl fmt::Display for FQAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FQAtom {
    type Err = AtomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
