//! Default path helpers and symlink checks.

use anyhow::{Result, anyhow};
use dirs::{config_dir, data_dir};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "VENV_MOVE_CONFIG";

/// Config file location: `$VENV_MOVE_CONFIG` if set, else `<config dir>/venv_move/config.xml`.
/// A relative override is resolved against the current directory.
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(p) = env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        let p = PathBuf::from(p);
        return if p.is_absolute() {
            Ok(p)
        } else {
            Ok(env::current_dir()?.join(p))
        };
    }
    let base = config_dir()
        .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok_or_else(|| anyhow!("cannot determine a config directory; set {CONFIG_ENV_VAR}"))?;
    Ok(base.join("venv_move").join("config.xml"))
}

/// Suggested log file location (`<data dir>/venv_move/venv_move.log`). Nothing is created.
pub fn default_log_path() -> Result<PathBuf> {
    let base = data_dir()
        .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))
        .ok_or_else(|| anyhow!("cannot determine a data directory"))?;
    Ok(base.join("venv_move").join("venv_move.log"))
}

/// Return true if any existing ancestor of `path` is a symlink.
pub fn path_has_symlink_ancestor(path: &Path) -> io::Result<bool> {
    let mut p = path.parent();
    while let Some(anc) = p {
        if anc.exists() && fs::symlink_metadata(anc)?.file_type().is_symlink() {
            return Ok(true);
        }
        p = anc.parent();
    }
    Ok(false)
}
