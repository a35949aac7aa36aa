//! Domain-grouped configuration structs, loaded from the environment.

use super::env_keys::{loader as loader_keys, observability as obv_keys, paths, sandbox};
use super::loader::{env_bool, env_optional, env_or};
use std::path::PathBuf;

/// One configured repository: `name=path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub name: String,
    pub path: PathBuf,
}

/// Parse `PORTMOD_REPOS` (`name=path:name=path`). Entries without a name
/// use the final path component.
pub fn parse_repo_list(raw: &str) -> Vec<RepoSpec> {
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, path)) => RepoSpec {
                name: name.trim().to_string(),
                path: PathBuf::from(path.trim()),
            },
            None => {
                let path = PathBuf::from(entry);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| entry.to_string());
                RepoSpec { name, path }
            }
        })
        .collect()
}

fn portmod_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portmod")
}

/// Repository and on-disk locations
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub repos: Vec<RepoSpec>,
    pub installed_dir: PathBuf,
    pub cfg_protect_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl PathsConfig {
    pub fn from_env() -> Self {
        super::loader::load_dotenv();
        let cache_dir = env_optional(paths::PORTMOD_CACHE_DIR, paths::CACHE_DIR_ALIASES)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from(".cache"))
                    .join("portmod")
            });
        let repos = env_optional(paths::PORTMOD_REPOS, &[])
            .map(|raw| parse_repo_list(&raw))
            .unwrap_or_default();
        let installed_dir =
            env_optional(paths::PORTMOD_INSTALLED_DIR, paths::INSTALLED_DIR_ALIASES)
                .map(PathBuf::from)
                .unwrap_or_else(|| portmod_data_root().join("db"));
        let cfg_protect_dir = env_optional(paths::PORTMOD_CFG_PROTECT_DIR, &[])
            .map(PathBuf::from)
            .unwrap_or_else(|| portmod_data_root().join("cfg_protect"));
        let tmp_dir = env_optional(paths::PORTMOD_TMP_DIR, &[])
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("portmod"));
        Self {
            cache_dir,
            repos,
            installed_dir,
            cfg_protect_dir,
            tmp_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackendKind {
    /// bwrap when available, otherwise an error unless the sandbox is disabled
    Auto,
    Bwrap,
    /// Run the worker directly, without isolation
    None,
}

impl SandboxBackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "bwrap" | "bubblewrap" => Some(Self::Bwrap),
            "none" | "off" => Some(Self::None),
            _ => None,
        }
    }
}

/// Default worker timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Sandbox execution settings
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub backend: SandboxBackendKind,
    pub timeout_secs: u64,
    /// Binary re-invoked in worker mode; defaults to the current executable.
    pub worker_bin: Option<PathBuf>,
    /// True when this process is itself a sandboxed worker.
    pub in_sandbox: bool,
}

impl SandboxSettings {
    pub fn from_env() -> Self {
        super::loader::load_dotenv();
        let mut backend = match env_optional(sandbox::PORTMOD_SANDBOX_BACKEND, &[]) {
            Some(raw) => SandboxBackendKind::parse(&raw).unwrap_or_else(|| {
                tracing::warn!("Invalid PORTMOD_SANDBOX_BACKEND: {}, using auto", raw);
                SandboxBackendKind::Auto
            }),
            None => SandboxBackendKind::Auto,
        };
        if env_bool(sandbox::PORTMOD_NO_SANDBOX, &[], false) {
            backend = SandboxBackendKind::None;
        }
        let timeout_secs = env_optional(sandbox::PORTMOD_TIMEOUT_SECS, &[])
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self {
            backend,
            timeout_secs,
            worker_bin: env_optional(sandbox::PORTMOD_WORKER_BIN, &[]).map(PathBuf::from),
            in_sandbox: env_bool(sandbox::PORTMOD_SANDBOXED, &[], false),
        }
    }
}

/// Package loader behaviour
#[derive(Debug, Clone, Default)]
pub struct LoaderSettings {
    /// Treat broken definitions as missing packages instead of aborting.
    pub tolerate_errors: bool,
    pub in_sandbox: bool,
}

impl LoaderSettings {
    pub fn from_env() -> Self {
        super::loader::load_dotenv();
        Self {
            tolerate_errors: env_bool(loader_keys::PORTMOD_TOLERATE_LOAD_ERRORS, &[], false),
            in_sandbox: env_bool(sandbox::PORTMOD_SANDBOXED, &[], false),
        }
    }
}

/// Observability: quiet, log_level, log_json, audit_log
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub quiet: bool,
    pub log_level: String,
    pub log_json: bool,
    pub audit_log: Option<String>,
}

impl ObservabilityConfig {
    pub fn from_env() -> &'static Self {
        use std::sync::OnceLock;
        static CACHE: OnceLock<ObservabilityConfig> = OnceLock::new();
        CACHE.get_or_init(|| {
            super::loader::load_dotenv();
            Self {
                quiet: env_bool(obv_keys::PORTMOD_QUIET, &[], false),
                log_level: env_or(obv_keys::PORTMOD_LOG_LEVEL, &[], || "portmod=info".to_string()),
                log_json: env_bool(obv_keys::PORTMOD_LOG_JSON, &[], false),
                audit_log: env_optional(obv_keys::PORTMOD_AUDIT_LOG, &[]),
            }
        })
    }
}
