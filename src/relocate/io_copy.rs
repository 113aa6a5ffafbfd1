//! Content copy for one regular file of the tree.
//!
//! The destination is always created fresh (`create_new`), so a file that
//! appears in the destination behind our back surfaces as `AlreadyExists`
//! instead of being clobbered. Fast paths: APFS clonefile on macOS,
//! `copy_file_range` on Linux; everything else streams through 1 MiB buffers.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

const BUF_SIZE: usize = 1024 * 1024;

/// Post-write flush behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Data reaches the page cache only. Enough for copy mode, where the
    /// source survives whatever happens to the destination.
    Cached,
    /// `sync_all` before returning. Move mode, since the source is deleted afterwards.
    Synced,
}

/// Copy `src` into a new file at `dst`; returns bytes copied.
pub fn copy_file_contents(src: &Path, dst: &Path, durability: Durability) -> io::Result<u64> {
    #[cfg(target_os = "macos")]
    {
        if let Some(bytes) = try_clonefile(src, dst)? {
            if durability == Durability::Synced {
                File::open(dst)?.sync_all()?;
            }
            return Ok(bytes);
        }
    }

    let src_f = File::open(src)?;
    let dst_f = OpenOptions::new().write(true).create_new(true).open(dst)?;

    #[cfg(target_os = "linux")]
    let (src_f, dst_f) = match kernel_copy(&src_f, &dst_f)? {
        Some(bytes) => {
            if durability == Durability::Synced {
                dst_f.sync_all()?;
            }
            return Ok(bytes);
        }
        None => (src_f, dst_f),
    };

    let mut reader = BufReader::with_capacity(BUF_SIZE, src_f);
    let mut writer = BufWriter::with_capacity(BUF_SIZE, dst_f);
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    if durability == Durability::Synced {
        writer.get_ref().sync_all()?;
    }
    Ok(bytes)
}

/// In-kernel copy. `Ok(None)` means the filesystem pair does not support it
/// and nothing was written, so the caller can stream instead.
#[cfg(target_os = "linux")]
fn kernel_copy(src: &File, dst: &File) -> io::Result<Option<u64>> {
    use std::os::unix::io::AsRawFd;
    const CHUNK: usize = 16 * 1024 * 1024;

    let mut total: u64 = 0;
    loop {
        let rc = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                std::ptr::null_mut(),
                dst.as_raw_fd(),
                std::ptr::null_mut(),
                CHUNK,
                0,
            )
        };
        if rc > 0 {
            total += rc as u64;
            continue;
        }
        if rc == 0 {
            return Ok(Some(total));
        }
        let err = io::Error::last_os_error();
        let unsupported = matches!(
            err.raw_os_error(),
            Some(libc::EXDEV) | Some(libc::ENOSYS) | Some(libc::EINVAL) | Some(libc::EPERM) | Some(libc::EOPNOTSUPP)
        );
        return if total == 0 && unsupported { Ok(None) } else { Err(err) };
    }
}

/// `Ok(None)` when cloning is not possible and the destination was not created.
#[cfg(target_os = "macos")]
fn try_clonefile(src: &Path, dst: &Path) -> io::Result<Option<u64>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let nul = |_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL");
    let src_c = CString::new(src.as_os_str().as_bytes()).map_err(nul)?;
    let dst_c = CString::new(dst.as_os_str().as_bytes()).map_err(nul)?;
    let rc = unsafe { libc::clonefile(src_c.as_ptr(), dst_c.as_ptr(), 0) };
    if rc == 0 {
        return Ok(Some(std::fs::metadata(dst)?.len()));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        return Err(err);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn copies_small_and_empty_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("activate");
        fs::write(&src, b"export VIRTUAL_ENV=/x\n").unwrap();
        let n = copy_file_contents(&src, &dir.path().join("out"), Durability::Cached).unwrap();
        assert_eq!(n, 22);
        assert_eq!(fs::read(dir.path().join("out")).unwrap(), fs::read(&src).unwrap());

        let empty = dir.path().join("__init__.py");
        File::create(&empty).unwrap();
        assert_eq!(copy_file_contents(&empty, &dir.path().join("e2"), Durability::Synced).unwrap(), 0);
    }

    #[test]
    fn refuses_to_clobber() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"data").unwrap();
        fs::write(&dst, b"x").unwrap();
        let err = copy_file_contents(&src, &dst, Durability::Cached).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&dst).unwrap(), b"x");
    }

    #[test]
    fn multi_buffer_copy_is_exact() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("libpython.so");
        let size = 2 * BUF_SIZE + 123;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();
        let dst = dir.path().join("copy.so");
        assert_eq!(copy_file_contents(&src, &dst, Durability::Synced).unwrap() as usize, size);
        assert_eq!(fs::read(&dst).unwrap(), data);
    }
}
