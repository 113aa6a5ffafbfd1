//! Reference scanner: finds every embedded occurrence of the old root inside a tree.
//!
//! Only `Metadata` and `TextShim` files yield rewrite sites. Occurrences in
//! other files are counted and reported so callers can warn about them, but
//! they are never touched.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::classify::{FileClass, RootMatcher, classify};
use crate::environment::MetadataRecord;
use crate::errors::RelocateError;
use crate::shutdown;

/// One occurrence of the old root that the patcher will rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSite {
    /// Path relative to the scanned tree root.
    pub file: PathBuf,
    /// Byte offset of the occurrence within the file.
    pub offset: usize,
    /// 1-based line number of the occurrence.
    pub line: usize,
    /// Exact bytes found at `offset`.
    pub old_value: Vec<u8>,
    pub class: FileClass,
}

impl ReferenceSite {
    pub fn old_value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.old_value).into_owned()
    }
}

/// Content identity of a file at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub len: u64,
    pub digest: blake3::Hash,
}

impl FileFingerprint {
    pub fn of(content: &[u8]) -> Self {
        Self {
            len: content.len() as u64,
            digest: blake3::hash(content),
        }
    }
}

/// Occurrences in a file the patcher leaves alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpaqueHit {
    pub file: PathBuf,
    pub class: FileClass,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub metadata: usize,
    pub text_shims: usize,
    pub binary_executables: usize,
    pub opaque_data: usize,
}

impl ClassCounts {
    fn bump(&mut self, class: FileClass) {
        match class {
            FileClass::Metadata => self.metadata += 1,
            FileClass::TextShim => self.text_shims += 1,
            FileClass::BinaryExecutable => self.binary_executables += 1,
            FileClass::OpaqueData => self.opaque_data += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub metadata_file: String,
    pub max_shim_bytes: u64,
}

/// Result of scanning one tree.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub root: PathBuf,
    pub old_roots: Vec<PathBuf>,
    /// Sorted by (file, offset).
    pub sites: Vec<ReferenceSite>,
    /// Fingerprint of every file that holds at least one site.
    pub fingerprints: BTreeMap<PathBuf, FileFingerprint>,
    pub opaque_hits: Vec<OpaqueHit>,
    /// Absolute symlinks whose target lies under the old root.
    pub internal_links: Vec<PathBuf>,
    pub counts: ClassCounts,
}

impl ScanReport {
    /// Sites grouped per file, in path order.
    pub fn files_with_sites(&self) -> BTreeMap<&Path, Vec<&ReferenceSite>> {
        let mut out: BTreeMap<&Path, Vec<&ReferenceSite>> = BTreeMap::new();
        for site in &self.sites {
            out.entry(site.file.as_path()).or_default().push(site);
        }
        out
    }

    pub fn files_scanned(&self) -> usize {
        let c = &self.counts;
        c.metadata + c.text_shims + c.binary_executables + c.opaque_data
    }
}

enum FileScan {
    Clean(FileClass),
    Sites {
        class: FileClass,
        sites: Vec<ReferenceSite>,
        fingerprint: FileFingerprint,
    },
    Opaque(OpaqueHit),
    Unreadable(PathBuf),
}

/// Scan `root` for references to any of `old_roots`.
///
/// Unreadable entries do not stop the walk; they are collected and reported
/// together as `ScanFailure` once the walk completes.
pub fn scan_tree(root: &Path, old_roots: &[PathBuf], opts: &ScanOptions) -> Result<ScanReport, RelocateError> {
    let matcher = RootMatcher::new(old_roots);
    let mut unreadable = Vec::new();
    let mut files = Vec::new();
    let mut internal_links = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                unreadable.push(e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()));
                continue;
            }
        };
        let ft = entry.file_type();
        if ft.is_file() {
            files.push(entry.into_path());
        } else if ft.is_symlink() {
            match fs::read_link(entry.path()) {
                Ok(target) if target.is_absolute() && old_roots.iter().any(|r| target.starts_with(r)) => {
                    internal_links.push(entry.into_path());
                }
                Ok(_) => {}
                Err(_) => unreadable.push(entry.into_path()),
            }
        }
    }

    let results: Vec<FileScan> = files
        .par_iter()
        .map(|path| {
            if shutdown::is_requested() {
                return Err(RelocateError::Interrupted);
            }
            Ok(scan_file(root, path, &matcher, opts))
        })
        .collect::<Result<_, _>>()?;

    let mut report = ScanReport {
        root: root.to_path_buf(),
        old_roots: old_roots.to_vec(),
        sites: Vec::new(),
        fingerprints: BTreeMap::new(),
        opaque_hits: Vec::new(),
        internal_links,
        counts: ClassCounts::default(),
    };

    for result in results {
        match result {
            FileScan::Clean(class) => report.counts.bump(class),
            FileScan::Sites {
                class,
                sites,
                fingerprint,
            } => {
                report.counts.bump(class);
                if let Some(first) = sites.first() {
                    debug!(file = %first.file.display(), sites = sites.len(), %class, "found references");
                    report.fingerprints.insert(first.file.clone(), fingerprint);
                }
                report.sites.extend(sites);
            }
            FileScan::Opaque(hit) => {
                report.counts.bump(hit.class);
                debug!(file = %hit.file.display(), occurrences = hit.occurrences, class = %hit.class, "reference in unpatchable file");
                report.opaque_hits.push(hit);
            }
            FileScan::Unreadable(p) => unreadable.push(p),
        }
    }

    if !unreadable.is_empty() {
        unreadable.sort();
        return Err(RelocateError::ScanFailure { unreadable });
    }

    report.sites.sort_by(|a, b| a.file.cmp(&b.file).then(a.offset.cmp(&b.offset)));
    info!(
        root = %root.display(),
        files = report.files_scanned(),
        sites = report.sites.len(),
        opaque = report.opaque_hits.len(),
        "scan complete"
    );
    Ok(report)
}

fn scan_file(root: &Path, path: &Path, matcher: &RootMatcher, opts: &ScanOptions) -> FileScan {
    let (meta, content) = match fs::symlink_metadata(path).and_then(|m| fs::read(path).map(|c| (m, c))) {
        Ok(v) => v,
        Err(_) => return FileScan::Unreadable(path.to_path_buf()),
    };
    let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    let class = classify(&rel, &meta, &content, &opts.metadata_file, opts.max_shim_bytes);

    let mut matches = matcher.find_all(&content);
    if matches.is_empty() {
        return FileScan::Clean(class);
    }

    if !class.is_patchable() {
        return FileScan::Opaque(OpaqueHit {
            file: rel,
            class,
            occurrences: matches.len(),
        });
    }

    // Metadata rewrites stay inside values; keys and spacing are never touched.
    if class == FileClass::Metadata {
        let record = MetadataRecord::parse(path, content.clone());
        matches.retain(|m| {
            record
                .entries()
                .iter()
                .any(|e| e.value_span.start <= m.offset && m.offset + m.len <= e.value_span.end)
        });
        if matches.is_empty() {
            return FileScan::Clean(class);
        }
    }

    let mut sites = Vec::with_capacity(matches.len());
    let mut line = 1usize;
    let mut cursor = 0usize;
    for m in matches {
        line += content[cursor..m.offset].iter().filter(|b| **b == b'\n').count();
        cursor = m.offset;
        sites.push(ReferenceSite {
            file: rel.clone(),
            offset: m.offset,
            line,
            old_value: matcher.alias(m.alias).to_vec(),
            class,
        });
    }

    FileScan::Sites {
        class,
        sites,
        fingerprint: FileFingerprint::of(&content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> ScanOptions {
        ScanOptions {
            metadata_file: "pyvenv.cfg".into(),
            max_shim_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn finds_sites_in_shims_and_record_values() {
        let td = tempdir().unwrap();
        let root = td.path().join("venv");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(
            root.join("pyvenv.cfg"),
            "home = /usr/bin\ncommand = /usr/bin/python3 -m venv /tmp/src/venv\n",
        )
        .unwrap();
        fs::write(root.join("bin/activate"), "VIRTUAL_ENV=\"/tmp/src/venv\"\nexport PATH=\"/tmp/src/venv/bin:$PATH\"\n").unwrap();
        fs::write(root.join("bin/pip"), "#!/tmp/src/venv/bin/python\nimport sys\n").unwrap();
        fs::write(root.join("bin/other"), "#!/tmp/src/venv2/bin/python\n").unwrap();

        let report = scan_tree(&root, &[PathBuf::from("/tmp/src/venv")], &opts()).unwrap();
        let per_file = report.files_with_sites();
        assert_eq!(per_file.len(), 3);
        assert_eq!(per_file[Path::new("bin/activate")].len(), 2);
        assert_eq!(per_file[Path::new("bin/activate")][1].line, 2);
        assert_eq!(per_file[Path::new("bin/pip")][0].offset, 2);
        assert_eq!(per_file[Path::new("pyvenv.cfg")][0].class, FileClass::Metadata);
        assert_eq!(per_file[Path::new("pyvenv.cfg")][0].line, 2);
        assert!(report.fingerprints.contains_key(Path::new("bin/pip")));
        assert!(!report.fingerprints.contains_key(Path::new("bin/other")));
        assert_eq!(report.sites[0].old_value_lossy(), "/tmp/src/venv");
    }

    #[test]
    fn opaque_files_are_reported_not_patched() {
        let td = tempdir().unwrap();
        let root = td.path().to_path_buf();
        fs::write(root.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/cache.pyc"), b"\x00\x00/old/venv/lib\x00").unwrap();
        fs::write(root.join("lib/RECORD"), "/old/venv/lib/x.py,sha256=,0\n").unwrap();

        let report = scan_tree(&root, &[PathBuf::from("/old/venv")], &opts()).unwrap();
        assert!(report.sites.is_empty());
        assert_eq!(report.opaque_hits.len(), 2);
        assert!(report.opaque_hits.iter().all(|h| h.class == FileClass::OpaqueData));
        assert_eq!(report.counts.metadata, 1);
        assert_eq!(report.files_scanned(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn internal_absolute_links_are_listed() {
        let td = tempdir().unwrap();
        let root = td.path().to_path_buf();
        std::os::unix::fs::symlink("/old/venv/lib/python3", root.join("lib64")).unwrap();
        std::os::unix::fs::symlink("/usr/bin/python3", root.join("python")).unwrap();
        std::os::unix::fs::symlink("lib", root.join("rel")).unwrap();

        let report = scan_tree(&root, &[PathBuf::from("/old/venv")], &opts()).unwrap();
        assert_eq!(report.internal_links, vec![root.join("lib64")]);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_fails_scan() {
        use std::os::unix::fs::PermissionsExt;
        // root ignores mode bits, nothing to assert there
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let td = tempdir().unwrap();
        let root = td.path().to_path_buf();
        let f = root.join("secret.sh");
        fs::write(&f, "echo /old/venv\n").unwrap();
        fs::set_permissions(&f, fs::Permissions::from_mode(0o000)).unwrap();

        let err = scan_tree(&root, &[PathBuf::from("/old/venv")], &opts()).unwrap_err();
        match err {
            RelocateError::ScanFailure { unreadable } => assert_eq!(unreadable, vec![f.clone()]),
            other => panic!("unexpected: {other}"),
        }
        fs::set_permissions(&f, fs::Permissions::from_mode(0o644)).unwrap();
    }
}
