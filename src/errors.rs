//! Typed error definitions for venv_move.
//! Every relocation failure maps to one well-known kind so the CLI can emit a
//! stable status line and exit code, and tests can match on variants.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::relocate::helpers::io_hint;

/// Failure modes of a relocation transaction. All of them are terminal and
/// trigger a rollback of the destination.
#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("Source environment not found: {} ({reason})", .path.display())]
    SourceNotFound { path: PathBuf, reason: &'static str },

    #[error("Destination already exists and is not empty: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Destination is claimed by another relocation in progress: {}", .0.display())]
    DestinationBusy(PathBuf),

    #[error("Invalid source/destination pair '{}' -> '{}': {reason}", .source_root.display(), .destination.display())]
    InvalidPaths {
        source_root: PathBuf,
        destination: PathBuf,
        reason: &'static str,
    },

    #[error("{op} '{}': {source}{}", .path.display(), io_hint(.source))]
    IoFailure {
        op: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Unreadable entries during scan ({} total): {}", .unreadable.len(), join_paths(.unreadable))]
    ScanFailure { unreadable: Vec<PathBuf> },

    #[error("File changed between scan and patch: {}", .0.display())]
    ConcurrentModification(PathBuf),

    #[error("Cannot patch {}: {reason}", .path.display())]
    PatchFailure { path: PathBuf, reason: String },

    #[error("Relocation interrupted by user")]
    Interrupted,
}

impl RelocateError {
    /// Stable snake_case identifier used in the status line.
    pub fn kind(&self) -> &'static str {
        match self {
            RelocateError::SourceNotFound { .. } => "source_not_found",
            RelocateError::DestinationExists(_) => "destination_exists",
            RelocateError::DestinationBusy(_) => "destination_busy",
            RelocateError::InvalidPaths { .. } => "invalid_paths",
            RelocateError::IoFailure { .. } => "io_failure",
            RelocateError::ScanFailure { .. } => "scan_failure",
            RelocateError::ConcurrentModification(_) => "concurrent_modification",
            RelocateError::PatchFailure { .. } => "patch_failure",
            RelocateError::Interrupted => "interrupted",
        }
    }

    /// Process exit code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            RelocateError::SourceNotFound { .. } => 10,
            RelocateError::DestinationExists(_) => 11,
            RelocateError::DestinationBusy(_) => 12,
            RelocateError::IoFailure { .. } => 13,
            RelocateError::ScanFailure { .. } => 14,
            RelocateError::ConcurrentModification(_) => 15,
            RelocateError::PatchFailure { .. } => 16,
            RelocateError::Interrupted => 17,
            RelocateError::InvalidPaths { .. } => 18,
        }
    }

    /// Adapter for `.map_err(...)` on io results, in the style of `io_error_with_help`.
    pub fn io<'a>(op: &'a str, path: &'a Path) -> impl FnOnce(io::Error) -> RelocateError + 'a {
        move |source| RelocateError::IoFailure {
            op: op.to_string(),
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn patch(path: &Path, reason: impl Into<String>) -> Self {
        RelocateError::PatchFailure {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    const SHOWN: usize = 5;
    let mut s = paths
        .iter()
        .take(SHOWN)
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if paths.len() > SHOWN {
        s.push_str(&format!(", ... ({} more)", paths.len() - SHOWN));
    }
    s
}

/// Pipeline step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Transfer,
    Scan,
    Patch,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Transfer => "transfer",
            Step::Scan => "scan",
            Step::Patch => "patch",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relocation error tagged with the step that produced it.
/// Returned only after the transaction has been rolled back.
#[derive(Debug, Error)]
#[error("{step} step failed: {error}")]
pub struct StepError {
    pub step: Step,
    #[source]
    pub error: RelocateError,
}

impl StepError {
    pub fn new(step: Step, error: RelocateError) -> Self {
        Self { step, error }
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn code(&self) -> i32 {
        self.error.code()
    }
}

/// Verifier failures (the import check itself failing is reported, not an error).
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Interpreter not found in environment: {}", .0.display())]
    InterpreterMissing(PathBuf),

    #[error("Failed to run interpreter {}: {source}", .interpreter.display())]
    Spawn {
        interpreter: PathBuf,
        source: io::Error,
    },
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::InterpreterMissing(_) => "interpreter_missing",
            VerifyError::Spawn { .. } => "spawn_failed",
        }
    }

    pub fn code(&self) -> i32 {
        21
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes_are_distinct() {
        let errs = [
            RelocateError::SourceNotFound {
                path: "/x".into(),
                reason: "missing",
            },
            RelocateError::DestinationExists("/y".into()),
            RelocateError::DestinationBusy("/y".into()),
            RelocateError::InvalidPaths {
                source_root: "/x".into(),
                destination: "/x/y".into(),
                reason: "nested",
            },
            RelocateError::IoFailure {
                op: "copy".into(),
                path: "/z".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
            RelocateError::ScanFailure { unreadable: vec![] },
            RelocateError::ConcurrentModification("/z".into()),
            RelocateError::patch(Path::new("/z"), "bad"),
            RelocateError::Interrupted,
        ];
        let mut kinds: Vec<_> = errs.iter().map(|e| e.kind()).collect();
        let mut codes: Vec<_> = errs.iter().map(|e| e.code()).collect();
        kinds.sort();
        kinds.dedup();
        codes.sort();
        codes.dedup();
        assert_eq!(kinds.len(), errs.len());
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn scan_failure_lists_paths_and_truncates() {
        let unreadable: Vec<PathBuf> = (0..8).map(|i| PathBuf::from(format!("/f{i}"))).collect();
        let msg = RelocateError::ScanFailure { unreadable }.to_string();
        assert!(msg.contains("8 total"));
        assert!(msg.contains("/f0"));
        assert!(msg.contains("3 more"));
        assert!(!msg.contains("/f7"));
    }

    #[test]
    fn step_error_display_names_step() {
        let e = StepError::new(Step::Scan, RelocateError::Interrupted);
        assert_eq!(e.kind(), "interrupted");
        assert!(e.to_string().starts_with("scan step failed"));
    }
}
