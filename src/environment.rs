//! Environment descriptor and metadata record.
//!
//! A virtual environment is a directory holding a `pyvenv.cfg` record
//! (`key = value` lines), an interpreter entry point and installed packages.
//! The record is kept as raw bytes plus the byte span of every value so the
//! scanner can restrict rewrites to values (keys and spacing never change).

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::errors::RelocateError;

/// Default metadata record file name at the environment root.
pub const METADATA_FILE: &str = "pyvenv.cfg";

/// One `key = value` line of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    /// Lowercased, trimmed key.
    pub key: String,
    /// Trimmed value.
    pub value: String,
    /// Byte span of the value inside the raw record.
    pub value_span: Range<usize>,
    /// 1-based line number.
    pub line: usize,
}

/// Parsed metadata record (`pyvenv.cfg`).
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    path: PathBuf,
    raw: Vec<u8>,
    entries: Vec<MetadataEntry>,
}

impl MetadataRecord {
    /// Parse a record from raw bytes. Lines without `=` and `#` comments are ignored,
    /// matching how the interpreter's site module reads the file.
    pub fn parse(path: impl Into<PathBuf>, raw: Vec<u8>) -> Self {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        for (idx, line) in raw.split_inclusive(|b| *b == b'\n').enumerate() {
            let start = offset;
            offset += line.len();

            let body_end = line
                .iter()
                .rposition(|b| !matches!(b, b'\n' | b'\r'))
                .map(|i| i + 1)
                .unwrap_or(0);
            let body = &line[..body_end];
            if body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'#') {
                continue;
            }
            let Some(eq) = body.iter().position(|b| *b == b'=') else {
                continue;
            };
            let key = String::from_utf8_lossy(&body[..eq]).trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }

            let mut v_start = eq + 1;
            while v_start < body.len() && body[v_start].is_ascii_whitespace() {
                v_start += 1;
            }
            let mut v_end = body.len();
            while v_end > v_start && body[v_end - 1].is_ascii_whitespace() {
                v_end -= 1;
            }

            entries.push(MetadataEntry {
                key,
                value: String::from_utf8_lossy(&body[v_start..v_end]).into_owned(),
                value_span: start + v_start..start + v_end,
                line: idx + 1,
            });
        }

        Self {
            path: path.into(),
            raw,
            entries,
        }
    }

    /// Read and parse the record at `path`.
    pub fn read(path: &Path) -> io::Result<Self> {
        let raw = fs::read(path)?;
        Ok(Self::parse(path, raw))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Value for `key` (case-insensitive). Later duplicates win, as in site.py.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Directory of the interpreter the environment was created from.
    pub fn home(&self) -> Option<&Path> {
        self.get("home").map(Path::new)
    }

    /// Root path recorded at creation time, if any.
    ///
    /// `venv` records its invocation as `command = <python> -m venv <root>`;
    /// the last argument is the root when it is absolute.
    pub fn recorded_root(&self) -> Option<PathBuf> {
        let command = self.get("command")?;
        let last = command.split_whitespace().last()?;
        let p = PathBuf::from(last);
        p.is_absolute().then_some(p)
    }
}

/// A self-contained environment rooted at one directory.
#[derive(Debug, Clone)]
pub struct Environment {
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub metadata: MetadataRecord,
}

impl Environment {
    /// Open the environment at `root`, reading `metadata_file` from its top level.
    pub fn open(root: &Path, metadata_file: &str) -> Result<Self, RelocateError> {
        match fs::symlink_metadata(root) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(RelocateError::SourceNotFound {
                    path: root.to_path_buf(),
                    reason: "not a directory",
                });
            }
            Err(_) => {
                return Err(RelocateError::SourceNotFound {
                    path: root.to_path_buf(),
                    reason: "root does not exist",
                });
            }
        }

        let record_path = root.join(metadata_file);
        if !record_path.is_file() {
            return Err(RelocateError::SourceNotFound {
                path: record_path,
                reason: "metadata record missing",
            });
        }
        let metadata =
            MetadataRecord::read(&record_path).map_err(RelocateError::io("read metadata record", &record_path))?;

        Ok(Self {
            root: root.to_path_buf(),
            interpreter: interpreter_path(root),
            metadata,
        })
    }

    /// True when the interpreter entry is a symlink resolving outside the root
    /// (e.g. to a system-wide interpreter).
    pub fn interpreter_is_external(&self) -> bool {
        match fs::read_link(&self.interpreter) {
            Ok(target) => {
                let resolved = if target.is_absolute() {
                    target
                } else {
                    self.interpreter
                        .parent()
                        .unwrap_or(&self.root)
                        .join(target)
                };
                !resolved.starts_with(&self.root)
            }
            Err(_) => false,
        }
    }
}

/// Interpreter entry point inside an environment root.
/// Prefers the platform's canonical launcher, then `python3`.
pub fn interpreter_path(root: &Path) -> PathBuf {
    #[cfg(windows)]
    let candidates = [root.join("Scripts").join("python.exe"), root.join("Scripts").join("python3.exe")];
    #[cfg(not(windows))]
    let candidates = [root.join("bin").join("python"), root.join("bin").join("python3")];

    candidates
        .iter()
        .find(|p| fs::symlink_metadata(p).is_ok())
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "home = /usr/bin\ninclude-system-site-packages = false\nversion = 3.12.3\n# comment = ignored\nexecutable = /usr/bin/python3.12\ncommand = /usr/bin/python3 -m venv /tmp/src/venv\n";

    #[test]
    fn parses_entries_and_spans() {
        let rec = MetadataRecord::parse("pyvenv.cfg", SAMPLE.as_bytes().to_vec());
        assert_eq!(rec.entries().len(), 5);
        assert_eq!(rec.get("HOME"), Some("/usr/bin"));
        assert_eq!(rec.home(), Some(Path::new("/usr/bin")));
        let cmd = rec.entries().iter().find(|e| e.key == "command").unwrap();
        assert_eq!(&SAMPLE.as_bytes()[cmd.value_span.clone()], cmd.value.as_bytes());
        assert_eq!(cmd.line, 6);
    }

    #[test]
    fn recorded_root_from_command() {
        let rec = MetadataRecord::parse("pyvenv.cfg", SAMPLE.as_bytes().to_vec());
        assert_eq!(rec.recorded_root(), Some(PathBuf::from("/tmp/src/venv")));

        let uv = MetadataRecord::parse("pyvenv.cfg", b"home = /usr/bin\nuv = 0.4.0\n".to_vec());
        assert_eq!(uv.recorded_root(), None);
    }

    #[test]
    fn crlf_and_padding_are_excluded_from_value() {
        let raw = b"home  =   /opt/py/bin  \r\n".to_vec();
        let rec = MetadataRecord::parse("pyvenv.cfg", raw.clone());
        let e = &rec.entries()[0];
        assert_eq!(e.value, "/opt/py/bin");
        assert_eq!(&raw[e.value_span.clone()], b"/opt/py/bin");
    }

    #[test]
    fn open_requires_metadata_record() {
        let td = tempdir().unwrap();
        let err = Environment::open(td.path(), METADATA_FILE).unwrap_err();
        assert_eq!(err.kind(), "source_not_found");

        let missing = td.path().join("nope");
        let err = Environment::open(&missing, METADATA_FILE).unwrap_err();
        assert_eq!(err.kind(), "source_not_found");
    }

    #[cfg(unix)]
    #[test]
    fn open_detects_external_interpreter() {
        let td = tempdir().unwrap();
        let root = td.path().join("venv");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join(METADATA_FILE), SAMPLE).unwrap();
        std::os::unix::fs::symlink("/usr/bin/python3", root.join("bin/python")).unwrap();

        let env = Environment::open(&root, METADATA_FILE).unwrap();
        assert_eq!(env.interpreter, root.join("bin/python"));
        assert!(env.interpreter_is_external());
    }
}
