//! Destination claim.
//!
//! Two relocations must never populate the same destination. Each transaction
//! holds an exclusive, non-blocking lock on a sidecar file next to the
//! destination (`<parent>/.venv_move.<name>.lock`) for its whole lifetime;
//! a second transaction that finds the lock held fails with `DestinationBusy`
//! instead of waiting.
//!
//! The lock is released (and the sidecar removed) when the guard drops.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::errors::RelocateError;

/// RAII guard for a claimed destination.
#[derive(Debug)]
pub struct DestinationClaim {
    file: File,
    lock_path: PathBuf,
}

impl DestinationClaim {
    /// Claim `destination` without blocking. Creates missing parent directories
    /// so the sidecar has somewhere to live.
    ///
    /// A releasing claimant unlinks the sidecar before unlocking it, so a lock
    /// won on an inode that is no longer at `lock_path` is worthless; the
    /// sidecar is reopened until the locked inode is the linked one.
    pub fn acquire(destination: &Path) -> Result<Self, RelocateError> {
        let lock_path = lock_file_path(destination);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(RelocateError::io("create destination parent", parent))?;
        }

        for attempt in 0..MAX_ATTEMPTS {
            let file = open_sidecar(&lock_path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => {
                    trace!(path = %lock_path.display(), "destination lock held elsewhere");
                    return Err(RelocateError::DestinationBusy(destination.to_path_buf()));
                }
                Err(e) => return Err(RelocateError::io("lock destination", &lock_path)(e)),
            }
            if is_linked_at(&file, &lock_path).map_err(RelocateError::io("stat destination lock", &lock_path))? {
                trace!(path = %lock_path.display(), "destination claimed");
                return Ok(Self { file, lock_path });
            }
            trace!(path = %lock_path.display(), attempt, "locked a released sidecar; reopening");
            let _ = FileExt::unlock(&file);
        }
        Err(RelocateError::DestinationBusy(destination.to_path_buf()))
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DestinationClaim {
    fn drop(&mut self) {
        // Name first; `acquire` rejects locks won on the unlinked inode.
        let _ = fs::remove_file(&self.lock_path);
        let _ = FileExt::unlock(&self.file);
    }
}

const MAX_ATTEMPTS: usize = 8;

fn open_sidecar(lock_path: &Path) -> Result<File, RelocateError> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    opts.custom_flags(libc::O_CLOEXEC).mode(0o600);
    opts.open(lock_path)
        .map_err(RelocateError::io("open destination lock", lock_path))
}

/// Whether `file` is still the inode linked at `path`.
#[cfg(unix)]
fn is_linked_at(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    match fs::symlink_metadata(path) {
        Ok(linked) => Ok(linked.dev() == held.dev() && linked.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Open files cannot be unlinked on Windows, so the sidecar cannot go stale.
#[cfg(not(unix))]
fn is_linked_at(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Sidecar lock path for `destination`.
pub fn lock_file_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".venv_move.{name}.lock"))
}
