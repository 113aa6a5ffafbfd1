//! Metadata carried over from source entries to their copies.
//! Permission bits must survive (shims have to stay executable), so failing to
//! set them is an error. Timestamps and xattrs are best-effort.

use filetime::{FileTime, set_file_times};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{trace, warn};

/// Apply `src_meta`'s permission bits to `dest`.
pub fn copy_permissions(dest: &Path, src_meta: &fs::Metadata) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = src_meta.permissions().mode() & 0o7777;
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
        trace!(path = %dest.display(), mode = format!("{:o}", mode), "set permissions");
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(dest)?.permissions();
        perms.set_readonly(src_meta.permissions().readonly());
        fs::set_permissions(dest, perms)?;
    }
    Ok(())
}

/// Apply `src_meta`'s access and modification times to `dest` (best-effort).
pub fn copy_times(dest: &Path, src_meta: &fs::Metadata) {
    let at = FileTime::from_last_access_time(src_meta);
    let mt = FileTime::from_last_modification_time(src_meta);
    if let Err(e) = set_file_times(dest, at, mt) {
        warn!(path = %dest.display(), error = %e, "failed to set atime/mtime");
    }
}

/// Copy extended attributes (no-op without the `xattrs` feature).
pub fn copy_xattrs(src: &Path, dest: &Path) {
    #[cfg(feature = "xattrs")]
    {
        let names = match xattr::list(src) {
            Ok(n) => n,
            Err(e) => {
                warn!(src = %src.display(), error = %e, "failed to list xattrs");
                return;
            }
        };
        for name in names {
            let value = match xattr::get(src, &name) {
                Ok(v) => v.unwrap_or_default(),
                Err(e) => {
                    warn!(src = %src.display(), xattr = %name.to_string_lossy(), error = %e, "failed to read xattr");
                    continue;
                }
            };
            if let Err(e) = xattr::set(dest, &name, &value) {
                warn!(dest = %dest.display(), xattr = %name.to_string_lossy(), error = %e, "failed to set xattr");
            }
        }
    }
    #[cfg(not(feature = "xattrs"))]
    {
        let _ = (src, dest);
    }
}
