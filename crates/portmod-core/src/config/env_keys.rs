//! Environment variable key constants.
//!
//! Primary keys use the `PORTMOD_*` prefix; a few legacy `PORTMOD_*_DIR`
//! spellings are kept as aliases.

/// Repository and on-disk locations
pub mod paths {
    pub const PORTMOD_CACHE_DIR: &str = "PORTMOD_CACHE_DIR";
    pub const CACHE_DIR_ALIASES: &[&str] = &["PORTMOD_CACHE"];

    /// `name=path` pairs separated by `:`
    pub const PORTMOD_REPOS: &str = "PORTMOD_REPOS";

    pub const PORTMOD_INSTALLED_DIR: &str = "PORTMOD_INSTALLED_DIR";
    pub const INSTALLED_DIR_ALIASES: &[&str] = &["PORTMOD_DB"];

    pub const PORTMOD_CFG_PROTECT_DIR: &str = "PORTMOD_CFG_PROTECT_DIR";

    pub const PORTMOD_TMP_DIR: &str = "PORTMOD_TMP_DIR";
}

/// Sandbox execution
pub mod sandbox {
    /// `auto`, `bwrap` or `none`
    pub const PORTMOD_SANDBOX_BACKEND: &str = "PORTMOD_SANDBOX_BACKEND";
    pub const PORTMOD_NO_SANDBOX: &str = "PORTMOD_NO_SANDBOX";
    pub const PORTMOD_TIMEOUT_SECS: &str = "PORTMOD_TIMEOUT_SECS";
    pub const PORTMOD_WORKER_BIN: &str = "PORTMOD_WORKER_BIN";
    /// Set to `1` in the environment of every worker process.
    pub const PORTMOD_SANDBOXED: &str = "PORTMOD_SANDBOXED";
}

/// Loader behaviour
pub mod loader {
    pub const PORTMOD_TOLERATE_LOAD_ERRORS: &str = "PORTMOD_TOLERATE_LOAD_ERRORS";
}

/// Observability and logging
pub mod observability {
    pub const PORTMOD_QUIET: &str = "PORTMOD_QUIET";
    pub const PORTMOD_LOG_LEVEL: &str = "PORTMOD_LOG_LEVEL";
    pub const PORTMOD_LOG_JSON: &str = "PORTMOD_LOG_JSON";
    pub const PORTMOD_AUDIT_LOG: &str = "PORTMOD_AUDIT_LOG";
}
