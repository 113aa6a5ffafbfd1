//! Windows implementations of platform helpers (no ACL management).

use anyhow::{Result, bail};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use super::temp::tmp_sibling_name;

/// Open log file for appending.
pub fn open_log_file_secure_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Write a new config file via temp + rename. Fails if the target exists.
pub fn write_config_secure_new_0600(path: &Path, contents: &[u8]) -> Result<()> {
    if path.exists() {
        bail!("Config file already exists: {}", path.display());
    }
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "config path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp = tmp_sibling_name(path, "config");
    let mut f = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    f.write_all(contents)?;
    f.sync_all()?;
    drop(f);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Windows distinguishes file and directory links at creation time.
pub fn create_symlink(target: &Path, link: &Path, target_is_dir: bool) -> io::Result<()> {
    if target_is_dir {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}
