//! Post-install lifecycle modules.
//!
//! A module is loaded once to learn its functions, then each function is
//! called in its own worker. Workers keep nothing between calls: the caller
//! threads the state returned by one call into the next.

use crate::error::ModuleError;
use portmod_core::permissions::PermissionSet;
use portmod_core::protocol::{ModuleCallOutput, ModuleFunctionInfo, ModuleInfo, WorkerAction, WorkerKind};
use portmod_sandbox::{ExecRequest, Executor, FailureReason, SandboxedError};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Extension of lifecycle module files.
pub const MODULE_EXT: &str = "pmodule";

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    file: PathBuf,
    info: ModuleInfo,
}

impl Module {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn desc(&self) -> &str {
        &self.info.desc
    }

    pub fn functions(&self) -> &BTreeMap<String, ModuleFunctionInfo> {
        &self.info.functions
    }

    pub fn function(&self, name: &str) -> Option<&ModuleFunctionInfo> {
        self.info.functions.get(name)
    }
}

pub struct ModuleRuntime {
    executor: Arc<dyn Executor>,
    cfg_protect_dir: PathBuf,
}

impl ModuleRuntime {
    pub fn new(executor: Arc<dyn Executor>, cfg_protect_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            cfg_protect_dir: cfg_protect_dir.into(),
        }
    }

    pub fn cfg_protect_dir(&self) -> &Path {
        &self.cfg_protect_dir
    }

    /// Modules may read the whole filesystem but only write under
    /// config-protect, and never reach the network.
    pub fn permissions(&self) -> PermissionSet {
        PermissionSet::new()
            .with_global_read(true)
            .with_read_write([self.cfg_protect_dir.clone()])
            .with_network(false)
    }

    pub fn load(&self, path: &Path) -> Result<Module, ModuleError> {
        let request = ExecRequest::new(WorkerKind::Module, path, WorkerAction::Load, self.permissions());
        let value = self.executor.execute(&request)?.ok_or_else(|| {
            SandboxedError::new(WorkerAction::Load, path, FailureReason::NoOutput)
        })?;
        let info: ModuleInfo = decode(path, value)?;
        tracing::debug!("Loaded module {} ({} functions)", info.name, info.functions.len());
        Ok(Module {
            file: path.to_path_buf(),
            info,
        })
    }

    /// Call `function` with the current `state` and return the next state.
    ///
    /// The function and its declared parameters are checked before any
    /// worker is spawned.
    pub fn call(
        &self,
        module: &Module,
        function: &str,
        state: &Value,
        args: &Map<String, Value>,
    ) -> Result<ModuleCallOutput, ModuleError> {
        let declared = module.function(function).ok_or_else(|| ModuleError::UnknownFunction {
            module: module.name().to_string(),
            function: function.to_string(),
        })?;
        if let Some(param) = declared.params.iter().find(|p| !args.contains_key(*p)) {
            return Err(ModuleError::MissingArgument {
                function: function.to_string(),
                param: param.clone(),
            });
        }

        let request = ExecRequest::new(
            WorkerKind::Module,
            module.file(),
            WorkerAction::Execute,
            self.permissions(),
        )
        .with_function(function)
        .with_init(state.clone())
        .with_args(Value::Object(args.clone()))
        .with_saved_state(module.name());

        let output = match self.executor.execute(&request)? {
            Some(value) => decode::<ModuleCallOutput>(module.file(), value)?,
            None => ModuleCallOutput {
                state: state.clone(),
                shadow_files: Vec::new(),
            },
        };
        if let Some(stray) = output
            .shadow_files
            .iter()
            .find(|s| !self.confined(&s.shadow))
        {
            return Err(ModuleError::InvalidOutput {
                path: module.file().to_path_buf(),
                reason: format!("shadow file {} is outside config-protect", stray.shadow.display()),
            });
        }
        for staged in &output.shadow_files {
            tracing::info!(
                "{} staged an update to {} for review",
                module.name(),
                staged.target.display()
            );
        }
        Ok(output)
    }

    fn confined(&self, shadow: &Path) -> bool {
        shadow.starts_with(&self.cfg_protect_dir)
            && !shadow.components().any(|c| c == Component::ParentDir)
    }

    /// Drop the module's saved scratch state once its run is over.
    pub fn finish(&self, module: &Module) {
        self.executor.clear_state(module.name());
    }
}

fn decode<T: DeserializeOwned>(path: &Path, value: Value) -> Result<T, ModuleError> {
    serde_json::from_value(value).map_err(|e| ModuleError::InvalidOutput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
