//! Tracing initialization.
//! Builds a subscriber with EnvFilter, compact or JSON formatting, and optional file logging.
//!
//! Behavior:
//! - Console logs go to stderr; stdout carries only the status line and reports.
//! - Log level is driven by LogLevel (no RUST_LOG override here).
//! - If `log_file` is provided and passes safety checks, a non-blocking file layer is added.
//! - File logging is refused if any ancestor of the file path is a symlink.

use anyhow::Result;
use chrono::Local;
use std::fmt as stdfmt;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt as tsfmt;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry;
use tracing_subscriber::util::SubscriberInitExt;

use venv_move::output as out;
use venv_move::platform::open_log_file_secure_append;
use venv_move::{LogLevel, default_log_path, path_has_symlink_ancestor};

/// Human-friendly timestamp formatter (DD/MM/YY HH:MM:SS)
struct LocalHumanTime;
impl FormatTime for LocalHumanTime {
    fn format_time(&self, w: &mut tsfmt::format::Writer<'_>) -> stdfmt::Result {
        write!(w, "{}", Local::now().format("%d/%m/%y %H:%M:%S"))
    }
}

fn env_filter_for(lvl: LogLevel) -> EnvFilter {
    let level = match lvl {
        LogLevel::Quiet => LevelFilter::ERROR,
        LogLevel::Normal => LevelFilter::INFO,
        LogLevel::Info => LevelFilter::DEBUG,
        LogLevel::Debug => LevelFilter::TRACE,
    };
    EnvFilter::default().add_directive(level.into())
}

/// Open a non-blocking file writer, or explain on stderr why not.
fn maybe_open_non_blocking_writer(path: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    match path_has_symlink_ancestor(path) {
        Ok(true) => {
            out::print_warn(&format!(
                "refusing file logging: an ancestor of {} is a symlink",
                path.display()
            ));
            return None;
        }
        Err(e) => {
            out::print_warn(&format!("cannot check log path {}: {e}", path.display()));
            return None;
        }
        Ok(false) => {}
    }
    match open_log_file_secure_append(path) {
        Ok(file) => Some(tracing_appender::non_blocking(file)),
        Err(e) => {
            out::print_warn(&format!("cannot open log file {}: {e}", path.display()));
            None
        }
    }
}

/// Initialize tracing. Returns the file appender guard, which must be held
/// until exit so buffered lines are flushed.
pub fn init_tracing(lvl: LogLevel, log_file: Option<&Path>, json: bool) -> Result<Option<WorkerGuard>> {
    let env_filter = env_filter_for(lvl);

    if let Some(path) = log_file {
        if let Some((writer, guard)) = maybe_open_non_blocking_writer(path) {
            if json {
                let console = tsfmt::layer()
                    .json()
                    .with_timer(LocalHumanTime)
                    .with_target(true)
                    .with_writer(io::stderr);
                let file = tsfmt::layer()
                    .json()
                    .with_timer(LocalHumanTime)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(writer);
                registry().with(env_filter).with(console).with(file).try_init()?;
            } else {
                let console = tsfmt::layer()
                    .compact()
                    .with_timer(LocalHumanTime)
                    .with_target(false)
                    .with_writer(io::stderr);
                let file = tsfmt::layer()
                    .compact()
                    .with_timer(LocalHumanTime)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_writer(writer);
                registry().with(env_filter).with(console).with(file).try_init()?;
            }
            return Ok(Some(guard));
        }
        if let Ok(def) = default_log_path() {
            out::print_info(&format!("the default log path may work instead: {}", def.display()));
        }
    }

    if json {
        let console = tsfmt::layer()
            .json()
            .with_timer(LocalHumanTime)
            .with_target(true)
            .with_writer(io::stderr);
        registry().with(env_filter).with(console).try_init()?;
    } else {
        let console = tsfmt::layer()
            .compact()
            .with_timer(LocalHumanTime)
            .with_target(false)
            .with_writer(io::stderr);
        registry().with(env_filter).with(console).try_init()?;
    }
    Ok(None)
}
