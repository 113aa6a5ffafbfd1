use std::io;
use std::path::Path;

use crate::errors::RelocateError;

/// Headroom kept free on top of the tree size.
const CUSHION: u64 = 4 * 1024 * 1024;

pub fn format_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.1} GiB", f / GB)
    } else if f >= MB {
        format!("{:.1} MiB", f / MB)
    } else if f >= KB {
        format!("{:.1} KiB", f / KB)
    } else {
        format!("{} B", n)
    }
}

/// Fail early when the filesystem holding `dst_dir` cannot take `required` bytes.
pub fn ensure_space_for_copy(dst_dir: &Path, required: u64) -> Result<(), RelocateError> {
    let free = fs2::available_space(dst_dir).map_err(RelocateError::io("query free space", dst_dir))?;
    if free < required.saturating_add(CUSHION) {
        return Err(RelocateError::IoFailure {
            op: "reserve space".into(),
            path: dst_dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::StorageFull,
                format!("need ~{}, free {}", format_bytes(required), format_bytes(free)),
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn impossible_requirement_is_io_failure() {
        let td = tempfile::tempdir().unwrap();
        let err = ensure_space_for_copy(td.path(), u64::MAX - 1).unwrap_err();
        assert_eq!(err.kind(), "io_failure");
        assert!(err.to_string().contains("insufficient space"));
        ensure_space_for_copy(td.path(), 1).unwrap();
    }
}
