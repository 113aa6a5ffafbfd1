//! Transaction guard around one relocation.
//!
//! A transaction claims the destination, runs the pipeline steps and either
//! commits or restores the pre-transaction state of the destination (absent,
//! or an empty directory).
//! Dropping a transaction that is still pending rolls it back, so early
//! returns and panics unwinding through the pipeline cannot leave a partial
//! environment behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::claim::DestinationClaim;
use crate::errors::{RelocateError, Step, StepError};
use crate::shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct RelocationTransaction {
    source: PathBuf,
    destination: PathBuf,
    status: TxStatus,
    /// Set once this transaction created (or adopted) the destination root;
    /// rollback never deletes a directory it does not own.
    owns_destination: bool,
    /// The destination was an empty directory before we started; rollback
    /// leaves it empty rather than removing it.
    adopted: bool,
    claim: Option<DestinationClaim>,
}

/// Ok(true) when `dest` exists as an empty directory, Ok(false) when absent.
fn destination_state(dest: &Path) -> Result<bool, RelocateError> {
    match fs::symlink_metadata(dest) {
        Ok(m) if m.is_dir() => {
            let mut entries = fs::read_dir(dest).map_err(RelocateError::io("list destination", dest))?;
            if entries.next().is_none() {
                Ok(true)
            } else {
                Err(RelocateError::DestinationExists(dest.to_path_buf()))
            }
        }
        Ok(_) => Err(RelocateError::DestinationExists(dest.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RelocateError::io("stat destination", dest)(e)),
    }
}

impl RelocationTransaction {
    /// Claim `destination`, then check under the claim that it is absent or
    /// an empty directory. Nothing inside the destination is written yet.
    ///
    /// A destination being populated by another transaction is reported as
    /// `DestinationBusy`, never `DestinationExists`.
    pub fn begin(source: &Path, destination: &Path, use_claim: bool) -> Result<Self, RelocateError> {
        let claim = if use_claim {
            Some(DestinationClaim::acquire(destination)?)
        } else {
            None
        };
        destination_state(destination)?;

        debug!(source = %source.display(), dest = %destination.display(), "transaction started");
        Ok(Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            status: TxStatus::Pending,
            owns_destination: false,
            adopted: false,
            claim,
        })
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }

    /// Create the destination root exclusively, or adopt it if it is an empty directory.
    pub fn create_destination_root(&mut self) -> Result<(), RelocateError> {
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).map_err(RelocateError::io("create destination parent", parent))?;
        }
        match fs::create_dir(&self.destination) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !destination_state(&self.destination)? {
                    return Err(RelocateError::DestinationExists(self.destination.clone()));
                }
                self.adopted = true;
            }
            Err(e) => return Err(RelocateError::io("create destination", &self.destination)(e)),
        }
        self.owns_destination = true;
        Ok(())
    }

    /// Run one pipeline step. On failure the transaction is rolled back before
    /// the error is returned, tagged with `step`.
    pub fn run<T>(
        &mut self,
        step: Step,
        f: impl FnOnce(&mut Self) -> Result<T, RelocateError>,
    ) -> Result<T, StepError> {
        let result = if shutdown::is_requested() {
            Err(RelocateError::Interrupted)
        } else {
            f(self)
        };
        result.map_err(|e| {
            warn!(step = %step, kind = e.kind(), error = %e, "step failed; rolling back");
            self.rollback();
            StepError::new(step, e)
        })
    }

    pub fn commit(mut self) {
        self.status = TxStatus::Committed;
        info!(dest = %self.destination.display(), "transaction committed");
    }

    /// Restore the destination to its pre-transaction state. Idempotent.
    pub fn rollback(&mut self) {
        if self.status != TxStatus::Pending {
            return;
        }
        self.status = TxStatus::RolledBack;
        if !self.owns_destination {
            return;
        }
        let restored = remove_tree(&self.destination).and_then(|()| {
            if self.adopted {
                fs::create_dir(&self.destination)
            } else {
                Ok(())
            }
        });
        match restored {
            Ok(()) => info!(dest = %self.destination.display(), adopted = self.adopted, "destination rolled back"),
            Err(e) => error!(dest = %self.destination.display(), error = %e, "rollback could not restore destination"),
        }
    }
}

impl Drop for RelocationTransaction {
    fn drop(&mut self) {
        if self.status == TxStatus::Pending {
            warn!(dest = %self.destination.display(), "transaction dropped while pending; rolling back");
            self.rollback();
        }
    }
}

/// Remove `root` recursively, restoring owner write permission on directories
/// copied read-only from the source when a first attempt fails.
fn remove_tree(root: &Path) -> io::Result<()> {
    match fs::remove_dir_all(root) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir()
                && let Ok(meta) = entry.metadata()
            {
                let mode = meta.permissions().mode() | 0o700;
                let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
            }
        }
    }
    #[cfg(not(unix))]
    {
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if let Ok(meta) = entry.metadata() {
                let mut perms = meta.permissions();
                if perms.readonly() {
                    perms.set_readonly(false);
                    let _ = fs::set_permissions(entry.path(), perms);
                }
            }
        }
    }
    fs::remove_dir_all(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn failed_step_removes_destination() {
        let td = tempdir().unwrap();
        let dest = td.path().join("dst").join("venv");
        let mut tx = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        let err = tx
            .run(Step::Transfer, |tx| {
                tx.create_destination_root()?;
                fs::write(tx.destination().join("partial"), "x").unwrap();
                Err::<(), _>(RelocateError::patch(Path::new("partial"), "boom"))
            })
            .unwrap_err();
        assert_eq!(err.step, Step::Transfer);
        assert_eq!(tx.status(), TxStatus::RolledBack);
        assert!(!dest.exists());
    }

    #[test]
    fn drop_while_pending_rolls_back() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        {
            let mut tx = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
            tx.run(Step::Transfer, |tx| tx.create_destination_root()).unwrap();
            assert!(dest.is_dir());
        }
        assert!(!dest.exists());
    }

    #[test]
    fn commit_keeps_destination() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        let mut tx = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        tx.run(Step::Transfer, |tx| tx.create_destination_root()).unwrap();
        tx.commit();
        assert!(dest.is_dir());
    }

    #[test]
    fn adopted_empty_destination_is_left_empty_on_rollback() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        fs::create_dir(&dest).unwrap();
        let mut tx = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        let _ = tx.run(Step::Scan, |tx| {
            tx.create_destination_root()?;
            fs::write(tx.destination().join("partial"), "x").unwrap();
            Err::<(), _>(RelocateError::Interrupted)
        });
        assert!(dest.is_dir());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn non_empty_destination_is_rejected_and_left_alone() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep"), "x").unwrap();
        let err = RelocationTransaction::begin(td.path(), &dest, true).unwrap_err();
        assert_eq!(err.kind(), "destination_exists");
        assert!(dest.join("keep").exists());
    }

    #[test]
    fn concurrent_claim_is_busy() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        let first = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        assert!(first.is_claimed());
        let err = RelocationTransaction::begin(td.path(), &dest, true).unwrap_err();
        assert_eq!(err.kind(), "destination_busy");
    }

    #[test]
    fn destination_populated_by_pending_transaction_is_busy() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        let mut first = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        first
            .run(Step::Transfer, |tx| {
                tx.create_destination_root()?;
                fs::write(tx.destination().join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
                Ok(())
            })
            .unwrap();
        assert_eq!(first.status(), TxStatus::Pending);

        let err = RelocationTransaction::begin(td.path(), &dest, true).unwrap_err();
        assert_eq!(err.kind(), "destination_busy");
        assert!(dest.join("pyvenv.cfg").is_file());

        drop(first);
        assert!(!dest.exists());
        let again = RelocationTransaction::begin(td.path(), &dest, true).unwrap();
        assert!(again.is_claimed());
    }

    #[test]
    fn rejected_destination_releases_its_claim() {
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep"), "x").unwrap();
        let err = RelocationTransaction::begin(td.path(), &dest, true).unwrap_err();
        assert_eq!(err.kind(), "destination_exists");
        assert!(!crate::relocate::lock_file_path(&dest).exists());
    }

    #[cfg(unix)]
    #[test]
    fn rollback_handles_read_only_directories() {
        use std::os::unix::fs::PermissionsExt;
        let td = tempdir().unwrap();
        let dest = td.path().join("venv");
        let mut tx = RelocationTransaction::begin(td.path(), &dest, false).unwrap();
        let _ = tx.run(Step::Transfer, |tx| {
            tx.create_destination_root()?;
            let ro = tx.destination().join("ro");
            fs::create_dir(&ro).unwrap();
            fs::write(ro.join("f"), "x").unwrap();
            fs::set_permissions(&ro, fs::Permissions::from_mode(0o555)).unwrap();
            Err::<(), _>(RelocateError::Interrupted)
        });
        assert!(!dest.exists());
    }
}
