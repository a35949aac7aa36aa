//! Command dispatch: each module registers handlers for its own commands.

mod load;
mod module;

use anyhow::{Context, Result};
use portmod_core::config::{LoaderSettings, PathsConfig, SandboxSettings};
use portmod_loader::{LoaderContext, ModuleRuntime, RepoTree};
use portmod_sandbox::SandboxExecutor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command_registry::CommandRegistry;

pub fn register_all(reg: &mut CommandRegistry) {
    load::register(reg);
    module::register(reg);
}

/// Executor for this run. Workers log one level above the controller's
/// own verbosity.
fn executor(paths: &PathsConfig, verbose: u8) -> Result<Arc<SandboxExecutor>> {
    let settings = SandboxSettings::from_env();
    let executor = SandboxExecutor::from_config(&settings, paths)
        .context("Failed to set up the sandbox")?
        .with_verbosity(verbose.saturating_add(1));
    tracing::debug!("Using sandbox backend '{}'", executor.backend_name());
    Ok(Arc::new(executor))
}

pub(crate) fn loader_context(verbose: u8) -> Result<LoaderContext> {
    let paths = PathsConfig::from_env();
    let executor = executor(&paths, verbose)?;
    Ok(
        LoaderContext::new(RepoTree::from_config(&paths), executor, &paths.cache_dir)
            .with_settings(LoaderSettings::from_env()),
    )
}

pub(crate) fn module_runtime(verbose: u8) -> Result<ModuleRuntime> {
    let paths = PathsConfig::from_env();
    let executor = executor(&paths, verbose)?;
    Ok(ModuleRuntime::new(executor, paths.cfg_protect_dir))
}

/// Make `path` absolute without resolving symlinks, so it still lines up
/// with configured repository roots.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to read the current directory")?
        .join(path))
}
