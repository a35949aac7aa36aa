//! Config protection.
//!
//! Modules never write system files directly. A change to `/etc/foo.cfg`
//! is staged as `<cfg_protect_dir>/etc/foo.cfg` and only reaches the real
//! path once the user accepts it.

use crate::error::CfgProtectError;
use portmod_core::observability;
use portmod_core::protocol::ShadowFile;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Where the staged copy of `target` lives.
pub fn shadow_path(cfg_dir: &Path, target: &Path) -> Result<PathBuf, CfgProtectError> {
    if !target.is_absolute() {
        return Err(CfgProtectError::RelativeTarget {
            target: target.to_path_buf(),
        });
    }
    let mut shadow = cfg_dir.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(part) => shadow.push(part),
            Component::ParentDir => {
                return Err(CfgProtectError::RelativeTarget {
                    target: target.to_path_buf(),
                })
            }
            _ => {}
        }
    }
    Ok(shadow)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CfgProtectError + '_ {
    move |source| CfgProtectError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every staged update, sorted by target.
pub fn pending_updates(cfg_dir: &Path) -> Result<Vec<ShadowFile>, CfgProtectError> {
    let mut found = Vec::new();
    if cfg_dir.is_dir() {
        collect(cfg_dir, cfg_dir, &mut found)?;
    }
    found.sort_by(|a, b| a.target.cmp(&b.target));
    Ok(found)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<ShadowFile>) -> Result<(), CfgProtectError> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(ShadowFile {
                target: Path::new("/").join(rel),
                shadow: path.clone(),
            });
        }
    }
    Ok(())
}

fn staged(cfg_dir: &Path, target: &Path) -> Result<PathBuf, CfgProtectError> {
    let shadow = shadow_path(cfg_dir, target)?;
    if !shadow.is_file() {
        return Err(CfgProtectError::NoPendingUpdate {
            target: target.to_path_buf(),
        });
    }
    Ok(shadow)
}

/// Apply the staged copy to `target` and drop it from the queue.
pub fn accept_update(cfg_dir: &Path, target: &Path) -> Result<(), CfgProtectError> {
    let shadow = staged(cfg_dir, target)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::copy(&shadow, target).map_err(io_err(target))?;
    fs::remove_file(&shadow).map_err(io_err(&shadow))?;
    prune_empty_dirs(cfg_dir, &shadow);
    tracing::info!("Accepted update to {}", target.display());
    observability::audit_cfg_protect(&target.to_string_lossy(), true);
    Ok(())
}

/// Throw the staged copy away; `target` is left untouched.
pub fn discard_update(cfg_dir: &Path, target: &Path) -> Result<(), CfgProtectError> {
    let shadow = staged(cfg_dir, target)?;
    fs::remove_file(&shadow).map_err(io_err(&shadow))?;
    prune_empty_dirs(cfg_dir, &shadow);
    tracing::info!("Discarded update to {}", target.display());
    observability::audit_cfg_protect(&target.to_string_lossy(), false);
    Ok(())
}

fn prune_empty_dirs(cfg_dir: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(d) = dir {
        if d == cfg_dir || !d.starts_with(cfg_dir) || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(cfg: &Path, target: &Path, content: &str) {
        let shadow = shadow_path(cfg, target).unwrap();
        fs::create_dir_all(shadow.parent().unwrap()).unwrap();
        fs::write(shadow, content).unwrap();
    }

    #[test]
    fn test_shadow_path() {
        let cfg = Path::new("/var/cfg");
        assert_eq!(
            shadow_path(cfg, Path::new("/etc/openmw/openmw.cfg")).unwrap(),
            PathBuf::from("/var/cfg/etc/openmw/openmw.cfg")
        );
        assert!(matches!(
            shadow_path(cfg, Path::new("etc/x")),
            Err(CfgProtectError::RelativeTarget { .. })
        ));
        assert!(shadow_path(cfg, Path::new("/etc/../root/x")).is_err());
    }

    #[test]
    fn test_pending_accept_discard() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        let sys = tmp.path().join("sys");
        let keep = sys.join("etc/keep.cfg");
        let drop = sys.join("etc/nested/drop.cfg");
        fs::create_dir_all(keep.parent().unwrap()).unwrap();
        fs::write(&keep, "old").unwrap();

        assert!(pending_updates(&cfg).unwrap().is_empty());
        stage(&cfg, &keep, "new");
        stage(&cfg, &drop, "unwanted");

        let pending = pending_updates(&cfg).unwrap();
        let targets: Vec<&Path> = pending.iter().map(|s| s.target.as_path()).collect();
        assert_eq!(targets, vec![keep.as_path(), drop.as_path()]);

        accept_update(&cfg, &keep).unwrap();
        assert_eq!(fs::read_to_string(&keep).unwrap(), "new");

        discard_update(&cfg, &drop).unwrap();
        assert!(!drop.exists());
        assert!(pending_updates(&cfg).unwrap().is_empty());
        assert!(cfg.is_dir());

        assert!(matches!(
            accept_update(&cfg, &keep),
            Err(CfgProtectError::NoPendingUpdate { .. })
        ));
    }
}
