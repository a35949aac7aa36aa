//! Definition commands: Load, Cache

use anyhow::Result;
use portmod_core::atom::Atom;
use portmod_loader::cache;
use portmod_loader::Package;
use serde_json::{json, Value};
use std::path::Path;

use super::{absolute, loader_context};
use crate::cli::{CacheCommands, Commands};
use crate::command_registry::CommandRegistry;

pub fn register(reg: &mut CommandRegistry) {
    reg.register(|cmd, verbose| {
        if let Commands::Load {
            target,
            installed,
            json,
        } = cmd
        {
            Some(cmd_load(target, *installed, *json, verbose))
        } else {
            None
        }
    });
    reg.register(|cmd, verbose| {
        if let Commands::Cache(CacheCommands::Check { path, installed }) = cmd {
            Some(cmd_cache_check(path, *installed, verbose))
        } else {
            None
        }
    });
}

fn looks_like_path(target: &str) -> bool {
    target.ends_with(".pybuild") || Path::new(target).is_file()
}

fn cmd_load(target: &str, installed: bool, as_json: bool, verbose: u8) -> Result<()> {
    let ctx = loader_context(verbose)?;
    let packages: Vec<Package> = if looks_like_path(target) {
        let path = absolute(Path::new(target))?;
        ctx.safe_load(&path, installed)?.into_iter().collect()
    } else {
        let atom = Atom::parse(target)?;
        ctx.load_atom(&atom)?
    };

    if packages.is_empty() {
        anyhow::bail!("No package matches '{}'", target);
    }
    if as_json {
        let out: Vec<Value> = packages
            .iter()
            .map(|p| {
                json!({
                    "atom": p.atom().to_string(),
                    "file": p.file(),
                    "installed": p.installed(),
                    "fields": p.fields(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for pkg in &packages {
        let marker = if pkg.installed() { " [installed]" } else { "" };
        println!("{}{}", pkg.atom(), marker);
        println!("  {}", pkg.file().display());
        for (key, value) in pkg.fields() {
            match value {
                Value::String(s) => println!("  {}: {}", key, s),
                other => println!("  {}: {}", key, other),
            }
        }
    }
    Ok(())
}

fn cmd_cache_check(path: &Path, installed: bool, verbose: u8) -> Result<()> {
    let ctx = loader_context(verbose)?;
    let path = absolute(path)?;
    let file = ctx.cache_file(&path, installed)?;
    let state = if cache::cache_valid(&file, ctx.tool_version()) {
        "valid"
    } else if file.exists() {
        "stale"
    } else {
        "missing"
    };
    println!("{}: {}", file.display(), state);
    Ok(())
}
