//! Relocation pipeline.
//!
//! `relocate` copies an environment to a new root and rewrites the references
//! that tie it to its old location, as one transaction:
//!
//!   resolve roots -> claim destination -> transfer -> scan -> patch -> commit
//!
//! Any failure after the claim rolls the destination back and reports the step
//! it happened in. The source is only removed (move mode) after commit.

mod atomic;
mod claim;
pub mod classify;
pub mod helpers;
mod io_copy;
mod metadata;
pub mod patch;
pub mod roots;
pub mod scan;
mod space;
pub mod transaction;
pub mod transfer;

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use claim::{DestinationClaim, lock_file_path};
pub use classify::FileClass;
pub use patch::PatchReport;
pub use roots::ResolvedRoots;
pub use scan::{OpaqueHit, ReferenceSite, ScanOptions, ScanReport};
pub use transaction::{RelocationTransaction, TxStatus};
pub use transfer::{TransferOptions, TransferReport};

use crate::environment::{Environment, METADATA_FILE};
use crate::errors::{RelocateError, Step, StepError};

/// Largest text file still treated as a patchable shim.
pub const DEFAULT_MAX_SHIM_BYTES: u64 = 1024 * 1024;

/// How many unpatched files a warning lists by name.
const SAMPLE_FILES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Copy,
    Move,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Copy => "copy",
            Mode::Move => "move",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RelocateOptions {
    pub mode: Mode,
    pub metadata_file: String,
    pub max_shim_bytes: u64,
    pub preserve_timestamps: bool,
    /// Skip the destination claim (single-user scripts on filesystems without locking).
    pub disable_locks: bool,
}

impl Default for RelocateOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Copy,
            metadata_file: METADATA_FILE.to_string(),
            max_shim_bytes: DEFAULT_MAX_SHIM_BYTES,
            preserve_timestamps: true,
            disable_locks: false,
        }
    }
}

impl RelocateOptions {
    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            metadata_file: self.metadata_file.clone(),
            max_shim_bytes: self.max_shim_bytes,
        }
    }
}

/// Non-fatal findings surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Old-root references left in files the patcher does not rewrite
    /// (compiled bytecode, package records, binaries).
    UnpatchedReferences {
        files: usize,
        occurrences: usize,
        sample: Vec<PathBuf>,
    },
    LongShebang { file: PathBuf, len: usize },
    SourceNotRemoved { path: PathBuf, error: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnpatchedReferences {
                files,
                occurrences,
                sample,
            } => {
                let names: Vec<String> = sample.iter().map(|p| p.display().to_string()).collect();
                write!(
                    f,
                    "{occurrences} reference(s) to the old root left in {files} non-patchable file(s): {}",
                    names.join(", ")
                )?;
                if *files > sample.len() {
                    write!(f, ", ...")?;
                }
                Ok(())
            }
            Warning::LongShebang { file, len } => write!(
                f,
                "{}: shebang is {len} bytes (limit {}); run it via the interpreter explicitly",
                file.display(),
                patch::MAX_SHEBANG_LEN
            ),
            Warning::SourceNotRemoved { path, error } => {
                write!(f, "relocated, but could not remove source {}: {error}", path.display())
            }
        }
    }
}

fn unpatched_warning(hits: &[OpaqueHit]) -> Option<Warning> {
    if hits.is_empty() {
        return None;
    }
    Some(Warning::UnpatchedReferences {
        files: hits.len(),
        occurrences: hits.iter().map(|h| h.occurrences).sum(),
        sample: hits.iter().take(SAMPLE_FILES).map(|h| h.file.clone()).collect(),
    })
}

/// Result of a committed relocation.
#[derive(Debug, Clone)]
pub struct RelocationOutcome {
    /// The environment at its new root.
    pub environment: Environment,
    pub source: PathBuf,
    pub mode: Mode,
    pub transfer: TransferReport,
    pub sites: usize,
    pub patch: PatchReport,
    pub warnings: Vec<Warning>,
    /// Move mode only: whether the source tree was deleted.
    pub source_removed: bool,
}

/// What a relocation would do, computed from the source without writing anything.
#[derive(Debug, Clone)]
pub struct RelocationPlan {
    pub environment: Environment,
    pub roots: ResolvedRoots,
    pub scan: ScanReport,
    pub warnings: Vec<Warning>,
}

/// Relocate the environment at `source` to `destination`.
///
/// On error the destination is back in its pre-call state and the returned
/// error names the failing step.
pub fn relocate(source: &Path, destination: &Path, opts: &RelocateOptions) -> Result<RelocationOutcome, StepError> {
    let (_, roots) = roots::resolve(source, destination, &opts.metadata_file)
        .map_err(|e| StepError::new(Step::Transfer, e))?;
    info!(
        src = %roots.source.display(),
        dest = %roots.destination.display(),
        mode = %opts.mode,
        aliases = roots.source_aliases.len(),
        "relocating environment"
    );

    let mut tx = RelocationTransaction::begin(&roots.source, &roots.destination, !opts.disable_locks)
        .map_err(|e| StepError::new(Step::Transfer, e))?;

    let transfer_opts = TransferOptions {
        preserve_timestamps: opts.preserve_timestamps,
        sync_files: opts.mode == Mode::Move,
    };
    let transfer = tx.run(Step::Transfer, |tx| {
        tx.create_destination_root()?;
        transfer::copy_tree(
            &roots.source,
            &roots.destination,
            &roots.source_aliases,
            &roots.destination,
            transfer_opts,
        )
    })?;

    let report = tx.run(Step::Scan, |_| {
        scan::scan_tree(&roots.destination, &roots.source_aliases, &opts.scan_options())
    })?;

    let (patched, environment) = tx.run(Step::Patch, |_| {
        let patched = patch::patch_tree(&report, &roots.destination, opts.preserve_timestamps)?;
        let env = Environment::open(&roots.destination, &opts.metadata_file)?;
        Ok((patched, env))
    })?;

    tx.commit();

    let mut warnings: Vec<Warning> = unpatched_warning(&report.opaque_hits).into_iter().collect();
    warnings.extend(
        patched
            .long_shebangs
            .iter()
            .map(|(file, len)| Warning::LongShebang {
                file: file.clone(),
                len: *len,
            }),
    );

    let mut source_removed = false;
    if opts.mode == Mode::Move {
        match fs::remove_dir_all(&roots.source) {
            Ok(()) => {
                source_removed = true;
                info!(src = %roots.source.display(), "source removed");
            }
            Err(e) => {
                warn!(src = %roots.source.display(), error = %e, "could not remove source after commit");
                warnings.push(Warning::SourceNotRemoved {
                    path: roots.source.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(RelocationOutcome {
        environment,
        source: roots.source,
        mode: opts.mode,
        transfer,
        sites: report.sites.len(),
        patch: patched,
        warnings,
        source_removed,
    })
}

/// Dry run: validate the pair and scan the source in place.
pub fn plan(source: &Path, destination: &Path, opts: &RelocateOptions) -> Result<RelocationPlan, StepError> {
    let (environment, roots) = roots::resolve(source, destination, &opts.metadata_file)
        .map_err(|e| StepError::new(Step::Transfer, e))?;
    inspect_destination(&roots.destination).map_err(|e| StepError::new(Step::Transfer, e))?;

    let scan = scan::scan_tree(&roots.source, &roots.source_aliases, &opts.scan_options())
        .map_err(|e| StepError::new(Step::Scan, e))?;
    let warnings = unpatched_warning(&scan.opaque_hits).into_iter().collect();
    info!(
        src = %roots.source.display(),
        dest = %roots.destination.display(),
        sites = scan.sites.len(),
        "dry-run: would relocate environment"
    );
    Ok(RelocationPlan {
        environment,
        roots,
        scan,
        warnings,
    })
}

/// Read-only destination checks for dry runs: not claimed by a relocation in
/// progress, and absent or empty.
fn inspect_destination(dest: &Path) -> Result<(), RelocateError> {
    let lock = lock_file_path(dest);
    if let Ok(f) = fs::File::open(&lock) {
        use fs2::FileExt;
        if f.try_lock_shared().is_err() {
            return Err(RelocateError::DestinationBusy(dest.to_path_buf()));
        }
        let _ = FileExt::unlock(&f);
    }
    if let Ok(m) = fs::symlink_metadata(dest) {
        let empty_dir = m.is_dir()
            && fs::read_dir(dest)
                .map(|mut it| it.next().is_none())
                .unwrap_or(false);
        if !empty_dir {
            return Err(RelocateError::DestinationExists(dest.to_path_buf()));
        }
    }
    Ok(())
}
