//! Module commands: Module load/call, CfgProtect

use anyhow::{Context, Result};
use portmod_core::config::PathsConfig;
use portmod_loader::cfg_protect;
use serde_json::{Map, Value};
use std::path::Path;

use super::{absolute, module_runtime};
use crate::cli::{CfgProtectCommands, Commands, ModuleCommands};
use crate::command_registry::CommandRegistry;

pub fn register(reg: &mut CommandRegistry) {
    reg.register(|cmd, verbose| match cmd {
        Commands::Module(ModuleCommands::Load { file }) => Some(cmd_module_load(file, verbose)),
        Commands::Module(ModuleCommands::Call {
            file,
            function,
            state,
            args,
        }) => Some(cmd_module_call(file, function, state, args, verbose)),
        _ => None,
    });
    reg.register(|cmd, _| {
        if let Commands::CfgProtect(action) = cmd {
            Some(cmd_cfg_protect(action))
        } else {
            None
        }
    });
}

fn cmd_module_load(file: &Path, verbose: u8) -> Result<()> {
    let runtime = module_runtime(verbose)?;
    let module = runtime.load(&absolute(file)?)?;
    println!("{}: {}", module.name(), module.desc());
    for (name, info) in module.functions() {
        println!("  {}({})  {}", name, info.params.join(", "), info.desc);
    }
    Ok(())
}

fn parse_object(raw: &str, what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", what))? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--{} must be a JSON object", what),
    }
}

fn cmd_module_call(file: &Path, function: &str, state: &str, args: &str, verbose: u8) -> Result<()> {
    let state = Value::Object(parse_object(state, "state")?);
    let args = parse_object(args, "args")?;
    let runtime = module_runtime(verbose)?;
    let module = runtime.load(&absolute(file)?)?;
    let result = runtime.call(&module, function, &state, &args);
    runtime.finish(&module);
    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !output.shadow_files.is_empty() {
        eprintln!(
            "{} update(s) staged; review with `portmod cfg-protect list`",
            output.shadow_files.len()
        );
    }
    Ok(())
}

fn cmd_cfg_protect(action: &CfgProtectCommands) -> Result<()> {
    let cfg_dir = PathsConfig::from_env().cfg_protect_dir;
    match action {
        CfgProtectCommands::List => {
            let pending = cfg_protect::pending_updates(&cfg_dir)?;
            if pending.is_empty() {
                println!("No pending updates.");
            }
            for update in pending {
                println!("{} ({})", update.target.display(), update.shadow.display());
            }
        }
        CfgProtectCommands::Accept { target } => {
            cfg_protect::accept_update(&cfg_dir, &absolute(target)?)?;
            println!("Updated {}", target.display());
        }
        CfgProtectCommands::Discard { target } => {
            cfg_protect::discard_update(&cfg_dir, &absolute(target)?)?;
            println!("Discarded update to {}", target.display());
        }
    }
    Ok(())
}
