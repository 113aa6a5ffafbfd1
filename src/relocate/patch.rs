//! Path patcher: rewrites every recorded reference site to the new root.
//!
//! Each file is rewritten whole, through a temp file and rename, and only when
//! its content still matches the fingerprint taken at scan time. A file that
//! already holds exactly the rewritten content is skipped, which makes a
//! second pass with the same report a no-op.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::atomic::replace_file;
use super::classify::path_bytes;
use super::scan::{FileFingerprint, ReferenceSite, ScanReport};
use crate::errors::RelocateError;
use crate::shutdown;

/// Longest `#!` line most kernels will execute.
pub const MAX_SHEBANG_LEN: usize = 127;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub files_patched: usize,
    pub files_already_patched: usize,
    pub sites_rewritten: usize,
    /// Patched files whose first line grew past `MAX_SHEBANG_LEN`, with its length.
    pub long_shebangs: Vec<(PathBuf, usize)>,
}

/// Splice `new` over every site. Sites must be sorted by offset and belong to `content`.
pub fn rewrite(content: &[u8], sites: &[&ReferenceSite], new: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(content.len() + sites.len() * new.len());
    let mut cursor = 0usize;
    for site in sites {
        let end = site.offset + site.old_value.len();
        if site.offset < cursor || end > content.len() {
            return Err(format!("site at offset {} lies outside the file", site.offset));
        }
        if content[site.offset..end] != site.old_value[..] {
            return Err(format!(
                "line {}: expected '{}' at offset {}",
                site.line,
                site.old_value_lossy(),
                site.offset
            ));
        }
        out.extend_from_slice(&content[cursor..site.offset]);
        out.extend_from_slice(new);
        cursor = end;
    }
    out.extend_from_slice(&content[cursor..]);
    Ok(out)
}

/// True when `content` is what `rewrite` would have produced from the file
/// the fingerprint describes.
fn is_already_patched(content: &[u8], sites: &[&ReferenceSite], new: &[u8], scanned: &FileFingerprint) -> bool {
    let mut original = Vec::with_capacity(scanned.len as usize);
    let mut cursor = 0usize;
    let mut shift: isize = 0;
    for site in sites {
        let pos = site.offset as isize + shift;
        if pos < cursor as isize {
            return false;
        }
        let pos = pos as usize;
        let end = pos + new.len();
        if end > content.len() || &content[pos..end] != new {
            return false;
        }
        original.extend_from_slice(&content[cursor..pos]);
        original.extend_from_slice(&site.old_value);
        cursor = end;
        shift += new.len() as isize - site.old_value.len() as isize;
    }
    original.extend_from_slice(&content[cursor..]);
    FileFingerprint::of(&original) == *scanned
}

fn first_line_len(content: &[u8]) -> Option<usize> {
    if !content.starts_with(b"#!") {
        return None;
    }
    let end = content.iter().position(|b| *b == b'\n').unwrap_or(content.len());
    let end = if end > 0 && content[end - 1] == b'\r' { end - 1 } else { end };
    Some(end)
}

/// Apply every site in `report` to the tree at `report.root`, substituting `new_root`.
pub fn patch_tree(report: &ScanReport, new_root: &Path, preserve_timestamps: bool) -> Result<PatchReport, RelocateError> {
    let new = path_bytes(new_root);
    let mut out = PatchReport::default();

    for (rel, sites) in report.files_with_sites() {
        if shutdown::is_requested() {
            return Err(RelocateError::Interrupted);
        }
        let path = report.root.join(rel);
        let Some(scanned) = report.fingerprints.get(rel) else {
            return Err(RelocateError::patch(&path, "no fingerprint recorded at scan time"));
        };

        let meta = match fs::symlink_metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(RelocateError::ConcurrentModification(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RelocateError::ConcurrentModification(path));
            }
            Err(e) => return Err(RelocateError::io("stat file", &path)(e)),
        };
        let content = fs::read(&path).map_err(RelocateError::io("read file", &path))?;

        if FileFingerprint::of(&content) != *scanned {
            if is_already_patched(&content, &sites, &new, scanned) {
                debug!(file = %rel.display(), "already patched; skipping");
                out.files_already_patched += 1;
                continue;
            }
            return Err(RelocateError::ConcurrentModification(path));
        }

        let patched = rewrite(&content, &sites, &new).map_err(|reason| RelocateError::patch(&path, reason))?;
        replace_file(&path, &patched, &meta, preserve_timestamps).map_err(|e| {
            RelocateError::patch(&path, format!("write failed: {e}"))
        })?;

        if let Some(len) = first_line_len(&patched)
            && len > MAX_SHEBANG_LEN
        {
            warn!(file = %rel.display(), len, limit = MAX_SHEBANG_LEN, "shebang line too long; the kernel may refuse to run it");
            out.long_shebangs.push((rel.to_path_buf(), len));
        }
        out.files_patched += 1;
        out.sites_rewritten += sites.len();
    }

    info!(
        root = %report.root.display(),
        files = out.files_patched,
        sites = out.sites_rewritten,
        skipped = out.files_already_patched,
        "references patched"
    );
    Ok(out)
}
