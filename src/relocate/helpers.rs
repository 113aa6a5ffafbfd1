//! I/O error hints.
//!
//! `io_hint` turns an io::Error into a short actionable suffix; `RelocateError`
//! appends it to every `IoFailure` message.

use std::io;

/// Platform-aware hint suffix for an io::Error (empty when nothing useful applies).
/// Includes the raw OS code when one is available.
pub fn io_hint(e: &io::Error) -> String {
    let mut msg = String::new();

    if let Some(code) = e.raw_os_error() {
        #[cfg(unix)]
        {
            let hint = match code {
                libc::EACCES | libc::EPERM => "permission denied; check ownership and write permissions",
                libc::EXDEV => "cross-filesystem; atomic rename not possible",
                libc::EBUSY => "resource busy; ensure no other process is writing",
                libc::ENOENT => "path not found; verify it exists",
                libc::EEXIST => "already exists; remove the target or pick another destination",
                libc::ENOSPC => "insufficient space on device",
                libc::EROFS => "read-only filesystem; cannot write here",
                libc::ELOOP => "too many symbolic link levels (ELOOP); possible symlink cycle",
                libc::ENAMETOOLONG => "filename or path too long; shorten path segments",
                libc::EMFILE => "process file descriptor limit reached; close files or raise limits",
                libc::ENFILE => "system-wide file table overflow; reduce open files",
                _ => "",
            };
            if !hint.is_empty() {
                msg.push_str("; ");
                msg.push_str(hint);
            }
        }
        #[cfg(windows)]
        {
            let hint = match code {
                5 => "access denied; check permissions",
                17 => "not same device; cross-filesystem move",
                32 => "sharing violation; file is in use",
                2 | 3 => "path not found; verify it exists",
                80 => "already exists; pick another destination",
                112 => "insufficient disk space",
                19 => "write protected / read-only media",
                206 => "filename or path too long (MAX_PATH exceeded)",
                4 => "too many open files; close handles or increase limit",
                _ => "",
            };
            if !hint.is_empty() {
                msg.push_str("; ");
                msg.push_str(hint);
            }
        }
        msg.push_str(&format!(" [os code: {}]", code));
    } else {
        let hint = match e.kind() {
            io::ErrorKind::PermissionDenied => "permission denied; check ownership and write permissions",
            io::ErrorKind::NotFound => "path not found; verify it exists",
            io::ErrorKind::AlreadyExists => "already exists; remove or choose another destination",
            io::ErrorKind::StorageFull => "insufficient space on device",
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                "busy/timed out; retry after the current writer finishes"
            }
            _ => "",
        };
        if !hint.is_empty() {
            msg.push_str("; ");
            msg.push_str(hint);
        }
    }

    msg
}
