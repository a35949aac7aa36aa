//! Loading package definitions safely.
//!
//! - `repo`: repository trees and atom lookup
//! - `cache`: hash-validated on-disk cache entries
//! - `loader`: [`LoaderContext`], the per-run memoizing loader
//! - `modules`: lifecycle module runtime
//! - `cfg_protect`: staged changes to system files awaiting review

pub mod cache;
pub mod cfg_protect;
pub mod error;
pub mod loader;
pub mod modules;
pub mod package;
pub mod repo;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{CacheError, CfgProtectError, LoadError, ModuleError};
pub use loader::LoaderContext;
pub use modules::{Module, ModuleRuntime};
pub use package::Package;
pub use repo::{RepoTree, Repository};
