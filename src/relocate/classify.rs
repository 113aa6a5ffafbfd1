//! File classification and old-root matching.
//!
//! Matching is byte-wise and boundary-aware: an occurrence of the root only
//! counts when it is not glued to a longer path on either side, so
//! `/tmp/src/venv` never matches inside `/tmp/src/venv2` or `/x/tmp/src/venv`.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

/// How the scanner treats a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    /// The environment's metadata record; patched field by field.
    Metadata,
    /// Small executable or sourceable text file; patched line by line.
    TextShim,
    /// Executable whose content is not text; never patched.
    BinaryExecutable,
    /// Everything else; never patched.
    OpaqueData,
}

impl FileClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileClass::Metadata => "metadata",
            FileClass::TextShim => "text_shim",
            FileClass::BinaryExecutable => "binary_executable",
            FileClass::OpaqueData => "opaque_data",
        }
    }

    /// True for classes whose references the patcher rewrites.
    pub fn is_patchable(&self) -> bool {
        matches!(self, FileClass::Metadata | FileClass::TextShim)
    }
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extensions of scripts that shells or the interpreter source at startup.
const SOURCEABLE_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "csh", "fish", "ps1", "bat", "cmd", "nu", "xsh", "pth",
];

/// Text means valid UTF-8 without NUL bytes.
pub fn is_text(content: &[u8]) -> bool {
    !content.contains(&0) && std::str::from_utf8(content).is_ok()
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn looks_like_script(rel_path: &Path, meta: &fs::Metadata, content: &[u8]) -> bool {
    if is_executable(meta) || content.starts_with(b"#!") {
        return true;
    }
    let name = rel_path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.starts_with("activate") {
        return true;
    }
    rel_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCEABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Classify a regular file from its path relative to the tree root, its
/// metadata and its content.
pub fn classify(
    rel_path: &Path,
    meta: &fs::Metadata,
    content: &[u8],
    metadata_file: &str,
    max_shim_bytes: u64,
) -> FileClass {
    if rel_path == Path::new(metadata_file) {
        return FileClass::Metadata;
    }
    if is_text(content) {
        if content.len() as u64 <= max_shim_bytes && looks_like_script(rel_path, meta, content) {
            FileClass::TextShim
        } else {
            FileClass::OpaqueData
        }
    } else if is_executable(meta) {
        FileClass::BinaryExecutable
    } else {
        FileClass::OpaqueData
    }
}

/// Raw bytes of a path as it would be embedded in a file.
pub fn path_bytes(p: &Path) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        p.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        p.to_string_lossy().into_owned().into_bytes()
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'~')
}

/// Bytes that may follow the old root: a separator or something that ends a
/// path token. Anything else (`+`, `@`, ...) extends the name into a sibling.
fn ends_root(b: u8) -> bool {
    b.is_ascii_whitespace()
        || matches!(
            b,
            b'/' | b'\\' | b'"' | b'\'' | b'`' | b':' | b';' | b'=' | b',' | b')' | b']' | b'}' | b'\0'
        )
}

/// One occurrence of an old-root alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub offset: usize,
    pub alias: usize,
    pub len: usize,
}

/// Finds occurrences of any alias of the old root inside file content.
#[derive(Debug, Clone)]
pub struct RootMatcher {
    aliases: Vec<Vec<u8>>,
}

impl RootMatcher {
    pub fn new(roots: &[impl AsRef<Path>]) -> Self {
        let mut aliases: Vec<Vec<u8>> = roots
            .iter()
            .map(|r| {
                let mut b = path_bytes(r.as_ref());
                while b.len() > 1 && b.ends_with(b"/") {
                    b.pop();
                }
                b
            })
            .filter(|b| b.len() > 1)
            .collect();
        // Longest first so that a longer alias wins when two start at one offset.
        aliases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        aliases.dedup();
        Self { aliases }
    }

    pub fn alias(&self, idx: usize) -> &[u8] {
        &self.aliases[idx]
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// All non-overlapping, boundary-respecting matches in ascending offset order.
    pub fn find_all(&self, hay: &[u8]) -> Vec<Match> {
        let mut out = Vec::new();
        if self.aliases.is_empty() {
            return out;
        }
        let mut i = 0usize;
        while i < hay.len() {
            let mut hit = None;
            if self.aliases.iter().any(|a| a[0] == hay[i]) {
                for (idx, alias) in self.aliases.iter().enumerate() {
                    if hay[i..].starts_with(alias) && self.at_boundary(hay, i, alias.len()) {
                        hit = Some(Match {
                            offset: i,
                            alias: idx,
                            len: alias.len(),
                        });
                        break;
                    }
                }
            }
            match hit {
                Some(m) => {
                    out.push(m);
                    i += m.len;
                }
                None => i += 1,
            }
        }
        out
    }

    fn at_boundary(&self, hay: &[u8], start: usize, len: usize) -> bool {
        if start > 0 {
            let before = hay[start - 1];
            if is_name_byte(before) || before == b'/' {
                return false;
            }
        }
        match hay.get(start + len) {
            Some(after) => ends_root(*after),
            None => true,
        }
    }
}
