//! Post-relocation verifier.
//!
//! Runs the environment's own interpreter once, importing every requested
//! module in a child process, and collects one outcome per module. The child
//! also reports `sys.prefix`, which must equal the environment root for the
//! interpreter to have picked up the relocated metadata record.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::environment::interpreter_path;
use crate::errors::VerifyError;

const IMPORT_SCRIPT: &str = r#"import importlib, sys
print("prefix\t" + sys.prefix, flush=True)
for name in sys.argv[1:]:
    try:
        importlib.import_module(name)
        print("ok\t" + name, flush=True)
    except BaseException as e:
        print("fail\t" + name + "\t" + type(e).__name__ + ": " + str(e).replace("\n", " "), flush=True)
"#;

/// A library to check: the distribution name shown to users and the module imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibrarySpec {
    pub label: String,
    pub module: String,
}

impl LibrarySpec {
    pub fn new(label: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            module: module.into(),
        }
    }
}

impl FromStr for LibrarySpec {
    type Err = String;

    /// Accepts `module`, `label=module`, or a requirement line such as
    /// `requests==2.32` (version specifiers and extras are dropped).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty library name".into());
        }
        if let Some((label, module)) = s.split_once('=')
            && !module.starts_with('=')
            && !label.ends_with(['<', '>', '!', '~'])
        {
            let (label, module) = (label.trim(), module.trim());
            if label.is_empty() || module.is_empty() {
                return Err(format!("invalid library spec '{s}'"));
            }
            return Ok(Self::new(label, module));
        }
        let name: String = s
            .chars()
            .take_while(|c| !matches!(c, '=' | '<' | '>' | '!' | '~' | ';' | '[' | ' ' | '@'))
            .collect();
        if name.is_empty() {
            return Err(format!("invalid library spec '{s}'"));
        }
        Ok(Self::new(name.clone(), name.replace('-', "_")))
    }
}

impl fmt::Display for LibrarySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label == self.module {
            f.write_str(&self.module)
        } else {
            write!(f, "{} ({})", self.label, self.module)
        }
    }
}

/// Parse a library list file: one spec per line, `#` comments and blank lines ignored.
pub fn parse_library_list(text: &str) -> Result<Vec<LibrarySpec>, String> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(LibrarySpec::from_str)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub library: LibrarySpec,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub root: PathBuf,
    pub interpreter: PathBuf,
    /// `sys.prefix` as reported by the interpreter.
    pub prefix: Option<PathBuf>,
    pub prefix_matches: bool,
    pub outcomes: Vec<ImportOutcome>,
}

impl VerifyReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ImportOutcome> {
        self.outcomes.iter().filter(|o| !o.ok)
    }

    pub fn all_ok(&self) -> bool {
        self.prefix_matches && self.outcomes.iter().all(|o| o.ok)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (dunce::canonicalize(a), dunce::canonicalize(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn run_interpreter(interpreter: &Path, modules: &[&str]) -> io::Result<Output> {
    let mut attempts = 0;
    loop {
        let out = Command::new(interpreter)
            .arg("-c")
            .arg(IMPORT_SCRIPT)
            .args(modules)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env_remove("PYTHONHOME")
            .env_remove("PYTHONPATH")
            .output();
        match out {
            // A freshly written launcher can still be open for writing in a forked child.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

/// Parse the child's stdout into outcomes, in request order.
fn parse_output(stdout: &str, libraries: &[LibrarySpec], fallback: &str) -> (Option<PathBuf>, Vec<ImportOutcome>) {
    let mut prefix = None;
    let mut results: Vec<(String, Option<String>)> = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(3, '\t');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("prefix"), Some(p), _) => prefix = Some(PathBuf::from(p)),
            (Some("ok"), Some(m), _) => results.push((m.to_string(), None)),
            (Some("fail"), Some(m), err) => results.push((m.to_string(), Some(err.unwrap_or("import failed").to_string()))),
            _ => debug!(line, "ignoring interpreter output line"),
        }
    }

    let outcomes = libraries
        .iter()
        .map(|lib| match results.iter().find(|(m, _)| *m == lib.module) {
            Some((_, None)) => ImportOutcome {
                library: lib.clone(),
                ok: true,
                error: None,
            },
            Some((_, Some(err))) => ImportOutcome {
                library: lib.clone(),
                ok: false,
                error: Some(err.clone()),
            },
            None => ImportOutcome {
                library: lib.clone(),
                ok: false,
                error: Some(fallback.to_string()),
            },
        })
        .collect();
    (prefix, outcomes)
}

/// Import every library with the interpreter of the environment at `root`.
///
/// Failing imports are reported in the returned `VerifyReport`; an error is
/// returned only when the interpreter cannot be run at all.
pub fn verify(root: &Path, libraries: &[LibrarySpec]) -> Result<VerifyReport, VerifyError> {
    let interpreter = interpreter_path(root);
    if !interpreter.exists() {
        return Err(VerifyError::InterpreterMissing(interpreter));
    }

    let modules: Vec<&str> = libraries.iter().map(|l| l.module.as_str()).collect();
    let output = run_interpreter(&interpreter, &modules).map_err(|source| VerifyError::Spawn {
        interpreter: interpreter.clone(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let fallback = format!(
        "no result from interpreter ({}){}",
        output.status,
        stderr
            .lines()
            .last()
            .map(|l| format!(": {l}"))
            .unwrap_or_default()
    );
    let (prefix, outcomes) = parse_output(&stdout, libraries, &fallback);
    let prefix_matches = prefix.as_deref().map(|p| same_dir(p, root)).unwrap_or(false);
    if !prefix_matches {
        warn!(root = %root.display(), prefix = ?prefix, "interpreter prefix does not match environment root");
    }

    let report = VerifyReport {
        root: root.to_path_buf(),
        interpreter,
        prefix,
        prefix_matches,
        outcomes,
    };
    info!(
        root = %root.display(),
        passed = report.passed(),
        failed = report.outcomes.len() - report.passed(),
        "verification finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_forms() {
        assert_eq!("numpy".parse::<LibrarySpec>().unwrap(), LibrarySpec::new("numpy", "numpy"));
        assert_eq!(
            "scikit-learn=sklearn".parse::<LibrarySpec>().unwrap(),
            LibrarySpec::new("scikit-learn", "sklearn")
        );
        assert_eq!(
            "requests==2.32.3".parse::<LibrarySpec>().unwrap(),
            LibrarySpec::new("requests", "requests")
        );
        assert_eq!(
            "typing-extensions>=4".parse::<LibrarySpec>().unwrap(),
            LibrarySpec::new("typing-extensions", "typing_extensions")
        );
        assert!("".parse::<LibrarySpec>().is_err());
        assert!("=x".parse::<LibrarySpec>().is_err());
    }

    #[test]
    fn list_skips_comments() {
        let libs = parse_library_list("# deps\nnumpy\n\nPillow=PIL  # imaging\n").unwrap();
        assert_eq!(libs, vec![LibrarySpec::new("numpy", "numpy"), LibrarySpec::new("Pillow", "PIL")]);
    }

    #[test]
    fn output_maps_to_requested_order() {
        let libs = vec![
            LibrarySpec::new("a", "a"),
            LibrarySpec::new("b", "b"),
            LibrarySpec::new("c", "c"),
        ];
        let out = "prefix\t/opt/venv\nok\tb\nfail\ta\tModuleNotFoundError: No module named 'a'\n";
        let (prefix, outcomes) = parse_output(out, &libs, "crashed");
        assert_eq!(prefix, Some(PathBuf::from("/opt/venv")));
        assert!(!outcomes[0].ok);
        assert!(outcomes[0].error.as_deref().unwrap().contains("No module named"));
        assert!(outcomes[1].ok);
        assert_eq!(outcomes[2].error.as_deref(), Some("crashed"));
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let td = tempfile::tempdir().unwrap();
        let err = verify(td.path(), &[LibrarySpec::new("os", "os")]).unwrap_err();
        assert_eq!(err.kind(), "interpreter_missing");
    }
}
