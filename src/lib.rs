//! Core library for `venv_move`.
//!
//! Relocates a Python virtual environment to a new root as one transaction:
//! copy the tree, find every reference to the old root, rewrite the ones that
//! live in patchable files, and either commit or roll the destination back.
//! A separate verifier imports libraries with the relocated interpreter.
//!
//! The binary (`main.rs`) layers config loading, logging and exit codes on top.

pub mod cli;
pub mod config;
pub mod environment;
pub mod errors;
pub mod output;
pub mod platform;
pub mod relocate;
pub mod report;
pub mod shutdown;
pub mod verify;

pub use config::{
    CONFIG_ENV_VAR, Config, LogLevel, default_config_path, default_log_path, load_config_from_xml_path,
    path_has_symlink_ancestor,
};
pub use environment::{Environment, METADATA_FILE, MetadataRecord};
pub use errors::{RelocateError, Step, StepError, VerifyError};
pub use relocate::{
    Mode, RelocateOptions, RelocationOutcome, RelocationPlan, Warning, lock_file_path, plan, relocate,
};
pub use report::{Status, StatusRecord};
pub use verify::{LibrarySpec, VerifyReport, verify};
