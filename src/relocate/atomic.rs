//! Whole-file replacement through a sibling temp file and rename.
//! Readers see either the old or the new content, never a partial write.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use super::metadata::{copy_permissions, copy_times};
use crate::platform::temp::tmp_sibling_name;

/// Replace `path` with `contents`, keeping the permission bits (and, when
/// `keep_times` is set, timestamps) recorded in `meta`.
pub fn replace_file(path: &Path, contents: &[u8], meta: &fs::Metadata, keep_times: bool) -> io::Result<()> {
    let tmp = tmp_sibling_name(path, "patch");
    let result = write_then_rename(&tmp, path, contents, meta, keep_times);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8], meta: &fs::Metadata, keep_times: bool) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).create_new(true).open(tmp)?;
    f.write_all(contents)?;
    f.sync_all()?;
    drop(f);

    copy_permissions(tmp, meta)?;
    if keep_times {
        copy_times(tmp, meta);
    }

    #[cfg(windows)]
    if path.exists() {
        fs::remove_file(path)?;
    }
    fs::rename(tmp, path)?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        // A failed directory fsync does not undo a completed rename.
        let _ = fs::File::open(parent).and_then(|d| d.sync_all());
    }
    Ok(())
}
