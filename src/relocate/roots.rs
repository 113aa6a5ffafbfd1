//! Source and destination path resolution.
//!
//! The old root may be spelled several ways inside an environment: the path
//! the user gave, its canonical form (symlinked parents resolved), and the
//! path recorded when the environment was created. All spellings that denote
//! the source directory become aliases the scanner looks for. The new root is
//! written exactly as the user gave it, made absolute.

use std::path::{Component, Path, PathBuf};

use crate::environment::Environment;
use crate::errors::RelocateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoots {
    /// Absolute source root.
    pub source: PathBuf,
    /// Every spelling of the source root, longest first, without duplicates.
    pub source_aliases: Vec<PathBuf>,
    /// Absolute destination root; this is the value written into patched files.
    pub destination: PathBuf,
}

/// Lexically absolute form of `p` (`.` and `..` folded, symlinks untouched).
pub fn absolutize(p: &Path) -> Result<PathBuf, RelocateError> {
    let abs = std::path::absolute(p).map_err(RelocateError::io("resolve absolute path", p))?;
    let mut out = PathBuf::new();
    for c in abs.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Canonical form of `p`, resolving the longest existing prefix and
/// appending the rest verbatim.
fn canonicalize_existing_prefix(p: &Path) -> PathBuf {
    let mut rest = Vec::new();
    let mut cur = p.to_path_buf();
    loop {
        if let Ok(c) = dunce::canonicalize(&cur) {
            let mut out = c;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (cur.file_name().map(|n| n.to_os_string()), cur.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                cur = parent.to_path_buf();
            }
            _ => return p.to_path_buf(),
        }
    }
}

fn invalid(source: &Path, destination: &Path, reason: &'static str) -> RelocateError {
    RelocateError::InvalidPaths {
        source_root: source.to_path_buf(),
        destination: destination.to_path_buf(),
        reason,
    }
}

/// Open the source environment and validate the pair. Performs no writes.
pub fn resolve(
    source: &Path,
    destination: &Path,
    metadata_file: &str,
) -> Result<(Environment, ResolvedRoots), RelocateError> {
    let source_abs = absolutize(source)?;
    let env = Environment::open(&source_abs, metadata_file)?;
    let destination_abs = absolutize(destination)?;

    if destination_abs.file_name().is_none() {
        return Err(invalid(&source_abs, &destination_abs, "destination has no final path component"));
    }

    let source_canon = dunce::canonicalize(&source_abs).map_err(RelocateError::io("canonicalize source", &source_abs))?;
    let dest_canon = canonicalize_existing_prefix(&destination_abs);
    if dest_canon == source_canon || destination_abs == source_abs {
        return Err(invalid(&source_abs, &destination_abs, "source and destination are the same"));
    }
    if dest_canon.starts_with(&source_canon) || destination_abs.starts_with(&source_abs) {
        return Err(invalid(&source_abs, &destination_abs, "destination lies inside the source"));
    }
    if source_canon.starts_with(&dest_canon) || source_abs.starts_with(&destination_abs) {
        return Err(invalid(&source_abs, &destination_abs, "source lies inside the destination"));
    }

    let mut aliases = vec![source_abs.clone(), source_canon.clone()];
    if let Some(recorded) = env.metadata.recorded_root()
        && dunce::canonicalize(&recorded).ok().as_ref() == Some(&source_canon)
    {
        aliases.push(recorded);
    }
    aliases.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()).then_with(|| a.cmp(b)));
    aliases.dedup();

    Ok((
        env,
        ResolvedRoots {
            source: source_abs,
            source_aliases: aliases,
            destination: destination_abs,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn venv(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
    }

    #[test]
    fn absolutize_folds_dots() {
        let p = absolutize(Path::new("/a/b/../c/./d")).unwrap();
        assert_eq!(p, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn rejects_nested_and_identical_pairs() {
        let td = tempdir().unwrap();
        let src = td.path().join("venv");
        venv(&src);

        let same = resolve(&src, &src, "pyvenv.cfg").unwrap_err();
        assert_eq!(same.kind(), "invalid_paths");
        let inside = resolve(&src, &src.join("sub/venv"), "pyvenv.cfg").unwrap_err();
        assert_eq!(inside.kind(), "invalid_paths");
        let outside = resolve(&src, td.path(), "pyvenv.cfg").unwrap_err();
        assert_eq!(outside.kind(), "invalid_paths");
    }

    #[test]
    fn missing_source_is_reported() {
        let td = tempdir().unwrap();
        let err = resolve(&td.path().join("nope"), &td.path().join("dst"), "pyvenv.cfg").unwrap_err();
        assert_eq!(err.kind(), "source_not_found");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_spelling_becomes_alias() {
        let td = tempdir().unwrap();
        let real = td.path().join("real");
        venv(&real.join("venv"));
        let link = td.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let (_, roots) = resolve(&link.join("venv"), &td.path().join("dst/venv"), "pyvenv.cfg").unwrap();
        assert_eq!(roots.source, link.join("venv"));
        assert!(roots.source_aliases.contains(&link.join("venv")));
        assert!(
            roots
                .source_aliases
                .contains(&dunce::canonicalize(real.join("venv")).unwrap())
        );
        assert_eq!(roots.destination, td.path().join("dst/venv"));
    }
}
