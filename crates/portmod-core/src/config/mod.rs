//! Portmod configuration layer.
//!
//! Every environment variable read goes through this module; other crates
//! consume structured config instead of calling `std::env::var` directly.
//!
//! - `loader`: `env_or`, `env_optional`, `env_bool` helpers
//! - `schema`: `PathsConfig`, `SandboxSettings`, `LoaderSettings`, `ObservabilityConfig`
//! - `env_keys`: key constants (with legacy aliases)

pub mod env_keys;
pub mod loader;
pub mod schema;

pub use loader::{env_bool, env_optional, env_or, load_dotenv, remove_env_var, set_env_var};
pub use schema::{
    LoaderSettings, ObservabilityConfig, PathsConfig, RepoSpec, SandboxBackendKind,
    SandboxSettings,
};
