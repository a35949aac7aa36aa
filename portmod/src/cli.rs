use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// portmod - sandboxed package definition loader
#[derive(Parser, Debug)]
#[command(name = "portmod")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load package definitions by atom (e.g. `cat/name-1.0::repo`) or file path
    Load {
        #[arg(value_name = "ATOM_OR_PATH")]
        target: String,

        /// Treat a path argument as part of the installed database
        #[arg(long)]
        installed: bool,

        /// Print the loaded fields as JSON
        #[arg(long)]
        json: bool,
    },

    /// Lifecycle modules
    #[command(subcommand)]
    Module(ModuleCommands),

    /// Review updates staged by modules
    #[command(name = "cfg-protect", subcommand)]
    CfgProtect(CfgProtectCommands),

    /// Inspect the metadata cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Sandboxed worker entry point (internal)
    #[command(name = "internal-worker", hide = true)]
    InternalWorker(WorkerArgs),
}

#[derive(Subcommand, Debug)]
pub enum ModuleCommands {
    /// Load a module and list its functions
    Load {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Call one module function
    Call {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[arg(value_name = "FUNCTION")]
        function: String,

        /// State from a previous call (JSON object)
        #[arg(long, default_value = "{}")]
        state: String,

        /// Call arguments (JSON object)
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CfgProtectCommands {
    /// List pending updates
    #[command(alias = "ls")]
    List,

    /// Apply a pending update to its target
    Accept {
        #[arg(value_name = "TARGET")]
        target: PathBuf,
    },

    /// Drop a pending update
    Discard {
        #[arg(value_name = "TARGET")]
        target: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Report whether the cache entry for a definition is still valid
    Check {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        #[arg(long)]
        installed: bool,
    },
}

/// Arguments of the hidden worker subcommand.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, default_value_t = 1)]
    pub verbosity: u8,

    /// Hex-encoded JSON environment
    #[arg(long)]
    pub env: Option<String>,

    /// Granted permissions (`ro:PATH`, `rw:PATH`, `global-read`, `network`)
    #[arg(long = "permission", value_name = "PERM")]
    pub permissions: Vec<String>,

    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    #[arg(long)]
    pub initial_state: Option<String>,

    #[arg(long)]
    pub args: Option<String>,

    #[arg(long)]
    pub module_func: Option<String>,

    /// `pybuild` or `module`
    pub kind: String,

    pub file: PathBuf,

    /// `load`, `execute`, `can-update-live` or `dump-environment`
    pub action: String,
}
