//! Core configuration types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::environment::METADATA_FILE;
use crate::relocate::{DEFAULT_MAX_SHIM_BYTES, Mode, RelocateOptions};

/// Program-defined verbosity levels exposed to users/config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Only errors
    Quiet,
    /// Progress milestones (default)
    #[default]
    Normal,
    /// Per-file detail
    Info,
    /// Everything
    Debug,
}

impl LogLevel {
    /// Parse common names (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" | "error" | "none" => Some(LogLevel::Quiet),
            "normal" => Some(LogLevel::Normal),
            "info" | "verbose" | "detailed" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Normal => "normal",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    }
}

impl FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid log level: '{s}'"))
    }
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: LogLevel,
    /// Optional log file in addition to stderr.
    pub log_file: Option<PathBuf>,
    /// Structured JSON logs and status output.
    pub json: bool,
    /// Metadata record file name at the environment root.
    pub metadata_file: String,
    /// Largest text file patched as a shim.
    pub max_shim_bytes: u64,
    pub preserve_timestamps: bool,
    pub disable_locks: bool,
    /// Libraries imported by `verify` when none are given on the command line.
    pub verify_libraries: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Normal,
            log_file: None,
            json: false,
            metadata_file: METADATA_FILE.to_string(),
            max_shim_bytes: DEFAULT_MAX_SHIM_BYTES,
            preserve_timestamps: true,
            disable_locks: false,
            verify_libraries: Vec::new(),
        }
    }
}

impl Config {
    /// Options for one relocation in `mode`.
    pub fn relocate_options(&self, mode: Mode) -> RelocateOptions {
        RelocateOptions {
            mode,
            metadata_file: self.metadata_file.clone(),
            max_shim_bytes: self.max_shim_bytes,
            preserve_timestamps: self.preserve_timestamps,
            disable_locks: self.disable_locks,
        }
    }
}
