//! Command registry: each dispatch module registers the handlers for its
//! own `Commands` variants.

use anyhow::Result;
use std::sync::Arc;

use crate::cli::Commands;

/// Returns `Some(result)` when it handles the command, `None` otherwise.
/// The second argument is the global verbosity.
pub type CommandHandler = Arc<dyn Fn(&Commands, u8) -> Option<Result<()>> + Send + Sync>;

/// Handlers are tried in registration order; the first match runs.
pub struct CommandRegistry {
    handlers: Vec<CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register<F>(&mut self, f: F)
    where
        F: Fn(&Commands, u8) -> Option<Result<()>> + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(f));
    }

    pub fn dispatch(&self, cmd: &Commands, verbose: u8) -> Result<()> {
        for h in &self.handlers {
            if let Some(r) = h(cmd, verbose) {
                return r;
            }
        }
        anyhow::bail!("no handler registered for {:?}", cmd)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
