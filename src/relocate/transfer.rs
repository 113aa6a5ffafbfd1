//! Tree transfer engine.
//!
//! Reproduces the source tree under an existing, empty destination root:
//! directories first, regular files in parallel, then symlinks, and finally
//! directory permissions and times deepest-first (a read-only directory must
//! not be locked down before its children are written).
//!
//! Symlinks are recreated without being followed. An absolute link that points
//! inside the source root is retargeted to the same place under the
//! destination; every other link keeps its target verbatim.

use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::io_copy::{Durability, copy_file_contents};
use super::metadata::{copy_permissions, copy_times, copy_xattrs};
use super::space::{ensure_space_for_copy, format_bytes};
use crate::errors::RelocateError;
use crate::platform;
use crate::shutdown;

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub preserve_timestamps: bool,
    /// Flush every copied file to disk. Required before a move deletes the source.
    pub sync_files: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            preserve_timestamps: true,
            sync_files: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    pub bytes: u64,
    /// Links (relative to the root) whose absolute target was moved under the destination.
    pub retargeted_links: Vec<PathBuf>,
}

struct Plan {
    dirs: Vec<(PathBuf, fs::Metadata)>,
    files: Vec<(PathBuf, fs::Metadata)>,
    links: Vec<PathBuf>,
    bytes: u64,
}

fn unsupported(path: &Path) -> RelocateError {
    RelocateError::IoFailure {
        op: "copy special file".into(),
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Unsupported, "sockets, fifos and device nodes cannot be relocated"),
    }
}

fn plan(src_root: &Path) -> Result<Plan, RelocateError> {
    let mut plan = Plan {
        dirs: Vec::new(),
        files: Vec::new(),
        links: Vec::new(),
        bytes: 0,
    };
    for entry in WalkDir::new(src_root).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src_root).to_path_buf();
            RelocateError::IoFailure {
                op: "walk source tree".into(),
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop detected")),
            }
        })?;
        let rel = entry.path().strip_prefix(src_root).unwrap_or(entry.path()).to_path_buf();
        let ft = entry.file_type();
        if ft.is_symlink() {
            plan.links.push(rel);
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| RelocateError::IoFailure {
                op: "stat source entry".into(),
                path: entry.path().to_path_buf(),
                source: e.into_io_error().unwrap_or_else(|| io::Error::other("stat failed")),
            })?;
        if ft.is_dir() {
            plan.dirs.push((rel, meta));
        } else if ft.is_file() {
            plan.bytes += meta.len();
            plan.files.push((rel, meta));
        } else {
            return Err(unsupported(entry.path()));
        }
    }
    Ok(plan)
}

fn interrupted() -> Result<(), RelocateError> {
    if shutdown::is_requested() {
        return Err(RelocateError::Interrupted);
    }
    Ok(())
}

/// Rewrite `target` when it is absolute and lies under one of `old_roots`.
pub fn retarget_link(target: &Path, old_roots: &[PathBuf], new_root: &Path) -> Option<PathBuf> {
    if !target.is_absolute() {
        return None;
    }
    old_roots
        .iter()
        .find_map(|r| target.strip_prefix(r).ok())
        .map(|rest| {
            if rest.as_os_str().is_empty() {
                new_root.to_path_buf()
            } else {
                new_root.join(rest)
            }
        })
}

/// Copy everything below `src_root` into the existing directory `dst_root`.
///
/// `old_roots` are the spellings of the source root used to recognise
/// internal absolute symlinks; `new_root` is what they are rewritten to.
pub fn copy_tree(
    src_root: &Path,
    dst_root: &Path,
    old_roots: &[PathBuf],
    new_root: &Path,
    opts: TransferOptions,
) -> Result<TransferReport, RelocateError> {
    let plan = plan(src_root)?;
    debug!(
        dirs = plan.dirs.len(),
        files = plan.files.len(),
        links = plan.links.len(),
        bytes = plan.bytes,
        "transfer plan ready"
    );
    ensure_space_for_copy(dst_root, plan.bytes)?;
    interrupted()?;
    let durability = if opts.sync_files {
        Durability::Synced
    } else {
        Durability::Cached
    };

    for (rel, _) in &plan.dirs {
        let d = dst_root.join(rel);
        fs::create_dir(&d).map_err(RelocateError::io("create directory", &d))?;
    }

    plan.files.par_iter().try_for_each(|(rel, meta)| {
        interrupted()?;
        let src = src_root.join(rel);
        let dst = dst_root.join(rel);
        copy_file_contents(&src, &dst, durability).map_err(RelocateError::io("copy file", &dst))?;
        copy_permissions(&dst, meta).map_err(RelocateError::io("set permissions", &dst))?;
        copy_xattrs(&src, &dst);
        if opts.preserve_timestamps {
            copy_times(&dst, meta);
        }
        Ok::<(), RelocateError>(())
    })?;
    interrupted()?;

    let mut retargeted_links = Vec::new();
    for rel in &plan.links {
        let src = src_root.join(rel);
        let dst = dst_root.join(rel);
        let target = fs::read_link(&src).map_err(RelocateError::io("read symlink", &src))?;
        let final_target = match retarget_link(&target, old_roots, new_root) {
            Some(t) => {
                debug!(link = %rel.display(), from = %target.display(), to = %t.display(), "retargeting internal symlink");
                retargeted_links.push(rel.clone());
                t
            }
            None => target,
        };
        let points_to_dir = fs::metadata(&src).map(|m| m.is_dir()).unwrap_or(false);
        platform::create_symlink(&final_target, &dst, points_to_dir)
            .map_err(RelocateError::io("create symlink", &dst))?;
    }

    // Deepest first, then the root itself.
    for (rel, meta) in plan.dirs.iter().rev() {
        let d = dst_root.join(rel);
        copy_permissions(&d, meta).map_err(RelocateError::io("set permissions", &d))?;
        if opts.preserve_timestamps {
            copy_times(&d, meta);
        }
    }
    let root_meta = fs::metadata(src_root).map_err(RelocateError::io("stat source root", src_root))?;
    copy_permissions(dst_root, &root_meta).map_err(RelocateError::io("set permissions", dst_root))?;
    if opts.preserve_timestamps {
        copy_times(dst_root, &root_meta);
    }

    let report = TransferReport {
        dirs: plan.dirs.len(),
        files: plan.files.len(),
        symlinks: plan.links.len(),
        bytes: plan.bytes,
        retargeted_links,
    };
    info!(
        src = %src_root.display(),
        dest = %dst_root.display(),
        files = report.files,
        size = %format_bytes(report.bytes),
        "tree transferred"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn retarget_only_internal_absolute_links() {
        let old = vec![PathBuf::from("/tmp/src/venv")];
        let new = Path::new("/opt/dst/venv");
        assert_eq!(
            retarget_link(Path::new("/tmp/src/venv/lib/python3.12"), &old, new),
            Some(PathBuf::from("/opt/dst/venv/lib/python3.12"))
        );
        assert_eq!(retarget_link(Path::new("/tmp/src/venv"), &old, new), Some(new.to_path_buf()));
        assert_eq!(retarget_link(Path::new("/usr/bin/python3"), &old, new), None);
        assert_eq!(retarget_link(Path::new("/tmp/src/venv2/x"), &old, new), None);
        assert_eq!(retarget_link(Path::new("lib"), &old, new), None);
    }

    #[test]
    fn copies_nested_tree() {
        let td = tempdir().unwrap();
        let src = td.path().join("src");
        let dst = td.path().join("dst");
        fs::create_dir_all(src.join("lib/site-packages/pkg")).unwrap();
        fs::write(src.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        fs::write(src.join("lib/site-packages/pkg/__init__.py"), "x = 1\n").unwrap();
        fs::create_dir(&dst).unwrap();

        let report = copy_tree(&src, &dst, &[src.clone()], &dst, TransferOptions::default()).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.dirs, 3);
        assert_eq!(fs::read_to_string(dst.join("lib/site-packages/pkg/__init__.py")).unwrap(), "x = 1\n");
        assert!(src.join("pyvenv.cfg").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated_not_followed() {
        let td = tempdir().unwrap();
        let src = td.path().join("src");
        let dst = td.path().join("dst");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::create_dir(&dst).unwrap();
        std::os::unix::fs::symlink("/usr/bin/python3", src.join("bin/python")).unwrap();
        std::os::unix::fs::symlink("python", src.join("bin/python3")).unwrap();
        std::os::unix::fs::symlink(src.join("lib"), src.join("lib64")).unwrap();

        let report = copy_tree(&src, &dst, &[src.clone()], &dst, TransferOptions::default()).unwrap();
        assert_eq!(report.symlinks, 3);
        assert_eq!(report.retargeted_links, vec![PathBuf::from("lib64")]);
        assert_eq!(fs::read_link(dst.join("bin/python")).unwrap(), PathBuf::from("/usr/bin/python3"));
        assert_eq!(fs::read_link(dst.join("bin/python3")).unwrap(), PathBuf::from("python"));
        assert_eq!(fs::read_link(dst.join("lib64")).unwrap(), dst.join("lib"));
    }

    #[cfg(unix)]
    #[test]
    fn fifo_aborts_transfer() {
        let td = tempdir().unwrap();
        let src = td.path().join("src");
        let dst = td.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        let fifo = src.join("pipe");
        let c = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c.as_ptr(), 0o644) }, 0);

        let err = copy_tree(&src, &dst, &[src.clone()], &dst, TransferOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "io_failure");
    }
}
