//! portmod CLI library: argument parsing, command dispatch and the
//! sandboxed worker entry point.

mod cli;
mod command_registry;
mod dispatch;
mod worker;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use command_registry::CommandRegistry;
use portmod_core::observability::{init_tracing, TracingMode};

/// Parse arguments and run the selected command.
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InternalWorker(args) = &cli.command {
        init_tracing(TracingMode::Worker {
            verbosity: args.verbosity,
        });
        return worker::run(args);
    }

    init_tracing(if cli.verbose > 0 {
        TracingMode::Worker {
            verbosity: cli.verbose.saturating_add(1),
        }
    } else {
        TracingMode::Default
    });

    let mut registry = CommandRegistry::new();
    dispatch::register_all(&mut registry);
    registry.dispatch(&cli.command, cli.verbose)
}
