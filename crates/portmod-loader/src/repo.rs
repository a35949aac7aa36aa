//! Repository trees: `<root>/<category>/<name>/<name>-<version>.pybuild`,
//! shared sources under `<root>/common/`, the repository name in
//! `<root>/profiles/repo_name`.

use crate::error::LoadError;
use portmod_core::atom::{Atom, FQAtom, INSTALLED_REPO};
use portmod_core::config::PathsConfig;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of package definition files.
pub const DEFINITION_EXT: &str = "pybuild";

/// Directory holding sources shared by many definitions.
pub const COMMON_DIR: &str = "common";

/// Top-level directories that are never categories.
const NON_CATEGORY_DIRS: &[&str] = &[COMMON_DIR, "profiles", "metadata", "licenses"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub root: PathBuf,
}

impl Repository {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Open a repository, preferring the name recorded in
    /// `profiles/repo_name` over `fallback_name`.
    pub fn open(fallback_name: &str, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = fs::read_to_string(root.join("profiles").join("repo_name"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback_name.to_string());
        Self { name, root }
    }

    pub fn common_dir(&self) -> PathBuf {
        self.root.join(COMMON_DIR)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Every definition in the tree, sorted by atom. Files whose names do
    /// not form a valid atom are skipped.
    pub fn definitions(&self) -> Vec<(FQAtom, PathBuf)> {
        let mut found = Vec::new();
        for category in sorted_dirs(&self.root) {
            let cat_name = match category.file_name().and_then(|n| n.to_str()) {
                Some(n) if !n.starts_with('.') && !NON_CATEGORY_DIRS.contains(&n) => n.to_string(),
                _ => continue,
            };
            for package in sorted_dirs(&category) {
                let Ok(entries) = fs::read_dir(&package) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(DEFINITION_EXT) {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match FQAtom::from_parts(&cat_name, stem, &self.name) {
                        Ok(atom) => found.push((atom, path)),
                        Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
                    }
                }
            }
        }
        found.sort();
        found
    }
}

fn sorted_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

/// A definition located in a repository tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Located {
    pub atom: FQAtom,
    pub path: PathBuf,
    pub installed: bool,
}

/// The repositories the loader reads from, plus the installed database.
#[derive(Debug, Clone, Default)]
pub struct RepoTree {
    repos: Vec<Repository>,
    installed: Option<Repository>,
}

impl RepoTree {
    pub fn new(repos: Vec<Repository>, installed: Option<Repository>) -> Self {
        let installed = installed.map(|r| Repository::new(INSTALLED_REPO, r.root));
        Self { repos, installed }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        let repos = paths
            .repos
            .iter()
            .map(|spec| Repository::open(&spec.name, &spec.path))
            .collect();
        Self::new(
            repos,
            Some(Repository::new(INSTALLED_REPO, &paths.installed_dir)),
        )
    }

    pub fn repos(&self) -> &[Repository] {
        &self.repos
    }

    pub fn installed(&self) -> Option<&Repository> {
        self.installed.as_ref()
    }

    /// Roots of every tree, installed database included.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.repos
            .iter()
            .chain(self.installed.iter())
            .map(|r| r.root.clone())
            .collect()
    }

    /// The tree owning `path`.
    pub fn repository_for(&self, path: &Path, installed: bool) -> Option<&Repository> {
        if installed {
            self.installed.as_ref().filter(|r| r.contains(path))
        } else {
            self.repos.iter().find(|r| r.contains(path))
        }
    }

    /// Derive the atom of a definition from where it sits. Depends only on
    /// the path, never on file contents.
    pub fn atom_for_path(&self, path: &Path, installed: bool) -> Result<FQAtom, LoadError> {
        let not_found = || LoadError::NotInRepository {
            path: path.to_path_buf(),
        };
        let repo = self.repository_for(path, installed).ok_or_else(not_found)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(not_found)?;
        let category = path
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .ok_or_else(not_found)?;
        Ok(FQAtom::from_parts(category, stem, &repo.name)?)
    }

    /// Every definition selected by `atom`. Installed packages are searched
    /// only when the atom has no repository or names `installed`.
    pub fn find(&self, atom: &Atom) -> Vec<Located> {
        let mut found = Vec::new();
        for repo in &self.repos {
            if atom.repo.as_deref().is_some_and(|r| r != repo.name) {
                continue;
            }
            found.extend(
                repo.definitions()
                    .into_iter()
                    .filter(|(fq, _)| atom.matches(fq))
                    .map(|(fq, path)| Located {
                        atom: fq,
                        path,
                        installed: false,
                    }),
            );
        }
        if let Some(installed) = &self.installed {
            if atom.repo.as_deref().map_or(true, |r| r == INSTALLED_REPO) {
                found.extend(
                    installed
                        .definitions()
                        .into_iter()
                        .filter(|(fq, _)| atom.matches(fq))
                        .map(|(fq, path)| Located {
                            atom: fq,
                            path,
                            installed: true,
                        }),
                );
            }
        }
        found
    }

    /// Like [`find`](Self::find), but fails with `AmbiguousAtom` when the
    /// available (non-installed) matches span more than one
    /// `category/name::repo`. Candidates are listed one per package.
    pub fn find_unique(&self, atom: &Atom) -> Result<Vec<Located>, LoadError> {
        let found = self.find(atom);
        let packages: BTreeSet<(String, String)> = found
            .iter()
            .filter(|l| !l.installed)
            .map(|l| (l.atom.cpn(), l.atom.repo().to_string()))
            .collect();
        if packages.len() > 1 {
            let mut candidates: Vec<FQAtom> = Vec::new();
            for (cpn, repo) in &packages {
                if let Some(l) = found
                    .iter()
                    .rev()
                    .find(|l| !l.installed && &l.atom.cpn() == cpn && l.atom.repo() == repo)
                {
                    candidates.push(l.atom.clone());
                }
            }
            return Err(LoadError::AmbiguousAtom {
                atom: atom.to_string(),
                candidates,
            });
        }
        Ok(found)
    }
}
