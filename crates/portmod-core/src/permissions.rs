//! Permission sets: the declarative filesystem policy a sandbox backend
//! enforces around one worker invocation.
//!
//! Pure data assembly; nothing here touches the filesystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Immutable read-only / read-write grant set.
///
/// A path present in both sets is read-write: write implies read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    read_only: BTreeSet<PathBuf>,
    read_write: BTreeSet<PathBuf>,
    global_read: bool,
    network: bool,
    tmp: Option<PathBuf>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_only<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.read_only.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_read_write<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.read_write.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_global_read(mut self, global_read: bool) -> Self {
        self.global_read = global_read;
        self
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    /// Private temp directory. Always granted read-write.
    pub fn with_tmp(mut self, tmp: impl Into<PathBuf>) -> Self {
        self.tmp = Some(tmp.into());
        self
    }

    /// Union of `base` and every override. Later overrides may add grants
    /// (including read-write on a path an earlier set granted read-only) but
    /// never remove one. The first `tmp` set wins.
    pub fn compose<'a, I>(base: &PermissionSet, overrides: I) -> PermissionSet
    where
        I: IntoIterator<Item = &'a PermissionSet>,
    {
        let mut out = base.clone();
        for other in overrides {
            out.read_only.extend(other.read_only.iter().cloned());
            out.read_write.extend(other.read_write.iter().cloned());
            out.global_read |= other.global_read;
            out.network |= other.network;
            if out.tmp.is_none() {
                out.tmp = other.tmp.clone();
            }
        }
        out
    }

    /// Every path granted read-only, as declared.
    pub fn read_only(&self) -> &BTreeSet<PathBuf> {
        &self.read_only
    }

    /// Every path granted read-write, including the temp directory.
    pub fn read_write(&self) -> BTreeSet<PathBuf> {
        let mut rw = self.read_write.clone();
        if let Some(tmp) = &self.tmp {
            rw.insert(tmp.clone());
        }
        rw
    }

    /// Read-only paths minus anything that is also writable.
    pub fn effective_read_only(&self) -> BTreeSet<PathBuf> {
        let rw = self.read_write();
        self.read_only
            .iter()
            .filter(|p| !rw.contains(*p))
            .cloned()
            .collect()
    }

    pub fn global_read(&self) -> bool {
        self.global_read
    }

    pub fn network(&self) -> bool {
        self.network
    }

    pub fn tmp(&self) -> Option<&Path> {
        self.tmp.as_deref()
    }

    pub fn can_read(&self, path: &Path) -> bool {
        self.global_read
            || self.read_only.iter().any(|p| path.starts_with(p))
            || self.can_write(path)
    }

    pub fn can_write(&self, path: &Path) -> bool {
        self.read_write().iter().any(|p| path.starts_with(p))
    }

    /// Flat `ro:`/`rw:` permission list handed to the worker on its
    /// command line.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for p in self.effective_read_only() {
            args.push(format!("ro:{}", p.display()));
        }
        for p in self.read_write() {
            args.push(format!("rw:{}", p.display()));
        }
        if self.global_read {
            args.push("global-read".to_string());
        }
        if self.network {
            args.push("network".to_string());
        }
        args
    }

    /// Inverse of [`to_args`](Self::to_args), used on the worker side.
    pub fn from_args<I, S>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = PermissionSet::new();
        for arg in args {
            match arg.as_ref() {
                "global-read" => set.global_read = true,
                "network" => set.network = true,
                other => {
                    if let Some(p) = other.strip_prefix("ro:") {
                        set.read_only.insert(PathBuf::from(p));
                    } else if let Some(p) = other.strip_prefix("rw:") {
                        set.read_write.insert(PathBuf::from(p));
                    } else {
                        return Err(format!("unknown permission '{}'", other));
                    }
                }
            }
        }
        Ok(set)
    }
}
