pub mod atom;
pub mod config;
pub mod hash;
pub mod observability;
pub mod permissions;
pub mod protocol;

/// Version string stamped into every cache entry. Bumping it invalidates
/// all cached definitions.
pub const PORTMOD_VERSION: &str = env!("CARGO_PKG_VERSION");
