//! CLI definition and parsing.
//!
//! Notes:
//! - `--debug` is a shorthand for `--log-level debug` and wins over it.
//! - Global flags may appear before or after the subcommand.

use clap::{Parser, Subcommand, ValueHint};
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::types::{Config, LogLevel};
use crate::relocate::Mode;

/// Relocate Python virtual environments.
/// CLI flags override config values (which are loaded from XML if present).
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Relocate Python virtual environments to a new path without breaking them",
    arg_required_else_help = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Enable debug logging (equivalent to `--log-level debug`).
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Set log level: quiet, normal, info, debug.
    #[arg(long, global = true, value_parser = LogLevel::from_str)]
    pub log_level: Option<LogLevel>,

    /// Also append logs to this file.
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,

    /// Emit logs and the status record as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Do not claim the destination with a lock file (filesystems without flock).
    #[arg(long, global = true)]
    pub disable_locks: bool,

    /// Print the config file location (or VENV_MOVE_CONFIG if set), then exit.
    #[arg(long)]
    pub print_config: bool,

    /// Write a commented template config to the config location, then exit.
    #[arg(long)]
    pub init_config: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy (or move) an environment to a new root and rewrite its internal paths.
    Relocate {
        /// Root of the existing environment.
        #[arg(value_hint = ValueHint::DirPath)]
        source: PathBuf,

        /// New root; must not exist or be an empty directory.
        #[arg(value_hint = ValueHint::DirPath)]
        destination: PathBuf,

        /// Delete the source after a successful relocation.
        #[arg(long = "move", conflicts_with = "copy")]
        move_source: bool,

        /// Keep the source (default).
        #[arg(long)]
        copy: bool,

        /// Scan the source and report what would be rewritten; write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Do not carry access/modification times over to the copy.
        #[arg(long)]
        no_preserve_timestamps: bool,

        /// After committing, import these libraries with the relocated interpreter
        /// (repeatable; `label=module` when names differ).
        #[arg(long = "verify", value_name = "LIBRARY")]
        verify: Vec<String>,
    },

    /// Import libraries with an environment's own interpreter.
    Verify {
        /// Root of the environment to check.
        #[arg(value_hint = ValueHint::DirPath)]
        root: PathBuf,

        /// Libraries to import (`module` or `label=module`).
        libraries: Vec<String>,

        /// Read library specs from a file, one per line (`#` comments allowed).
        #[arg(long, value_hint = ValueHint::FilePath)]
        libraries_file: Option<PathBuf>,
    },
}

impl Command {
    /// Relocation mode selected by `--move`/`--copy`.
    pub fn mode(&self) -> Mode {
        match self {
            Command::Relocate { move_source: true, .. } => Mode::Move,
            _ => Mode::Copy,
        }
    }
}

impl Args {
    /// Precedence: --debug > --log-level > None (use config).
    pub fn effective_log_level(&self) -> Option<LogLevel> {
        if self.debug {
            return Some(LogLevel::Debug);
        }
        self.log_level
    }

    /// Apply CLI overrides to a loaded Config (in-place). No-ops for unset flags.
    pub fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(level) = self.effective_log_level() {
            cfg.log_level = level;
        }
        if let Some(p) = &self.log_file {
            cfg.log_file = Some(p.clone());
        }
        if self.json {
            cfg.json = true;
        }
        if self.disable_locks {
            cfg.disable_locks = true;
        }
        if let Some(Command::Relocate {
            no_preserve_timestamps: true,
            ..
        }) = &self.command
        {
            cfg.preserve_timestamps = false;
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocate_move_and_globals_after_subcommand() {
        let args = Args::try_parse_from(["venv_move", "relocate", "/a", "/b", "--move", "--json", "-d"]).unwrap();
        let cmd = args.command.clone().unwrap();
        assert_eq!(cmd.mode(), Mode::Move);
        assert!(args.json);
        assert_eq!(args.effective_log_level(), Some(LogLevel::Debug));
    }

    #[test]
    fn move_conflicts_with_copy() {
        assert!(Args::try_parse_from(["venv_move", "relocate", "/a", "/b", "--move", "--copy"]).is_err());
    }

    #[test]
    fn invalid_log_level_is_usage_error() {
        let err = Args::try_parse_from(["venv_move", "--log-level", "loud", "relocate", "/a", "/b"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn overrides_apply() {
        let args = Args::try_parse_from([
            "venv_move",
            "--log-level",
            "quiet",
            "--disable-locks",
            "relocate",
            "/a",
            "/b",
            "--no-preserve-timestamps",
        ])
        .unwrap();
        let mut cfg = Config::default();
        args.apply_overrides(&mut cfg);
        assert_eq!(cfg.log_level, LogLevel::Quiet);
        assert!(cfg.disable_locks);
        assert!(!cfg.preserve_timestamps);
    }

    #[test]
    fn verify_collects_libraries() {
        let args = Args::try_parse_from(["venv_move", "verify", "/v", "numpy", "scikit-learn=sklearn"]).unwrap();
        match args.command.unwrap() {
            Command::Verify { root, libraries, .. } => {
                assert_eq!(root, PathBuf::from("/v"));
                assert_eq!(libraries, vec!["numpy", "scikit-learn=sklearn"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
