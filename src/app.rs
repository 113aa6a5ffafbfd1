//! Application orchestrator.
//! Loads and merges config, initializes logging, installs the interrupt
//! handler, then dispatches to relocate or verify and maps the result to an
//! exit code.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;

use venv_move::cli::{Args, Command};
use venv_move::output as out;
use venv_move::report::StatusRecord;
use venv_move::verify::{LibrarySpec, VerifyReport, parse_library_list};
use venv_move::{CONFIG_ENV_VAR, Config, Mode, StepError, VerifyError, default_config_path, shutdown};

use crate::logging::init_tracing;

/// Generic failure (config, logging setup, unreadable inputs).
const EXIT_FAILURE: i32 = 1;
/// Bad arguments detected after parsing.
const EXIT_USAGE: i32 = 2;
/// At least one library failed to import, or the prefix was wrong.
const EXIT_VERIFY_FAILED: i32 = 20;

/// Run the CLI application and return the process exit code.
pub fn run(args: Args) -> i32 {
    // Handle --print-config / --init-config before logging init
    if args.print_config {
        return print_config();
    }
    if args.init_config {
        return init_config();
    }

    let Some(command) = args.command.clone() else {
        out::print_error("no command given; see --help");
        return EXIT_USAGE;
    };

    let (cfg, cfg_path) = match load_merged(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            out::print_error(&format!("{e:#}"));
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = cfg.validate() {
        out::print_error(&format!("invalid configuration: {e:#}"));
        return EXIT_FAILURE;
    }
    let guard = match init_tracing(cfg.log_level, cfg.log_file.as_deref(), cfg.json) {
        Ok(g) => g,
        Err(e) => {
            out::print_error(&format!("failed to initialize logging: {e}"));
            return EXIT_FAILURE;
        }
    };

    // Guard is dropped on SIGINT to flush file logs
    let guard_slot: Arc<Mutex<Option<WorkerGuard>>> = Arc::new(Mutex::new(guard));
    {
        let guard_slot = Arc::clone(&guard_slot);
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown::request();
            out::print_warn("received interrupt; rolling back...");
            if let Ok(mut g) = guard_slot.lock() {
                let _ = g.take();
            }
        }) {
            out::print_warn(&format!("could not install interrupt handler: {e}"));
        }
    }

    debug!(?args, config = ?cfg_path, "starting venv_move");

    let code = match &command {
        Command::Relocate {
            source,
            destination,
            dry_run,
            verify,
            ..
        } => run_relocate(&cfg, command.mode(), source, destination, *dry_run, verify),
        Command::Verify {
            root,
            libraries,
            libraries_file,
        } => run_verify(&cfg, root, libraries, libraries_file.as_deref()),
    };

    // Ensure logs are flushed before exit
    if let Ok(mut g) = guard_slot.lock() {
        let _ = g.take();
    }
    code
}

fn print_config() -> i32 {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        out::print_user(&explicit);
        out::print_info(&format!("using {CONFIG_ENV_VAR} (explicit); unset it to use the default location"));
        return 0;
    }
    match default_config_path() {
        Ok(p) => {
            out::print_user(&p.display().to_string());
            if p.exists() {
                out::print_info("a config file exists at that location");
            } else {
                out::print_info("no config file there yet; run with --init-config to write a template");
            }
            0
        }
        Err(e) => {
            out::print_error(&format!("could not determine a config path: {e:#}"));
            EXIT_FAILURE
        }
    }
}

fn init_config() -> i32 {
    let path = match default_config_path() {
        Ok(p) => p,
        Err(e) => {
            out::print_error(&format!("could not determine a config path: {e:#}"));
            return EXIT_FAILURE;
        }
    };
    if path.exists() {
        out::print_error(&format!("config already exists: {}", path.display()));
        return EXIT_FAILURE;
    }
    match venv_move::config::create_template_config(&path) {
        Ok(()) => {
            out::print_success(&format!("template config written to {}", path.display()));
            out::print_info(&format!("edit it, or point {CONFIG_ENV_VAR} at another file"));
            0
        }
        Err(e) => {
            out::print_error(&format!("{e:#}"));
            EXIT_FAILURE
        }
    }
}

/// XML values (if a file exists) overlaid by CLI flags, plus the file they came from.
fn load_merged(args: &Args) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let (mut cfg, path) = match venv_move::config::load_config()? {
        Some((cfg, path)) => (cfg, Some(path)),
        None => (Config::default(), None),
    };
    args.apply_overrides(&mut cfg);
    Ok((cfg, path))
}

fn run_relocate(
    cfg: &Config,
    mode: Mode,
    source: &Path,
    destination: &Path,
    dry_run: bool,
    verify_libs: &[String],
) -> i32 {
    let opts = cfg.relocate_options(mode);
    let libs = match parse_specs(verify_libs.iter().map(String::as_str)) {
        Ok(libs) => libs,
        Err(e) => {
            out::print_error(&e);
            return EXIT_USAGE;
        }
    };

    if dry_run {
        return match venv_move::plan(source, destination, &opts) {
            Ok(plan) => {
                for site in &plan.scan.sites {
                    out::print_user(&format!(
                        "site file={} line={} class={} old={}",
                        site.file.display(),
                        site.line,
                        site.class,
                        site.old_value_lossy()
                    ));
                }
                for w in &plan.warnings {
                    out::print_warn(&w.to_string());
                }
                out::print_user(&StatusRecord::dry_run(&plan).render(cfg.json));
                0
            }
            Err(e) => report_rolled_back(cfg, &e, source, destination),
        };
    }

    let outcome = match venv_move::relocate(source, destination, &opts) {
        Ok(o) => o,
        Err(e) => return report_rolled_back(cfg, &e, source, destination),
    };
    for w in &outcome.warnings {
        out::print_warn(&w.to_string());
    }
    out::print_user(&StatusRecord::committed(&outcome).render(cfg.json));
    info!(
        src = %outcome.source.display(),
        dest = %outcome.environment.root.display(),
        files = outcome.transfer.files,
        sites = outcome.sites,
        "relocation committed"
    );

    if libs.is_empty() {
        return 0;
    }
    verify_and_report(cfg, &outcome.environment.root, &libs)
}

fn report_rolled_back(cfg: &Config, err: &StepError, source: &Path, destination: &Path) -> i32 {
    error!(
        code = err.code(),
        kind = err.kind(),
        step = err.step.as_str(),
        error = %err.error,
        "relocation failed"
    );
    out::print_error(&err.to_string());
    out::print_user(&StatusRecord::rolled_back(err, source, destination).render(cfg.json));
    err.code()
}

fn parse_specs<'a>(items: impl Iterator<Item = &'a str>) -> Result<Vec<LibrarySpec>, String> {
    items.map(LibrarySpec::from_str).collect()
}

fn run_verify(cfg: &Config, root: &Path, libraries: &[String], libraries_file: Option<&Path>) -> i32 {
    let mut specs = match parse_specs(libraries.iter().map(String::as_str)) {
        Ok(s) => s,
        Err(e) => {
            out::print_error(&e);
            return EXIT_USAGE;
        }
    };
    if let Some(file) = libraries_file {
        let listed = fs::read_to_string(file)
            .map_err(|e| format!("cannot read {}: {e}", file.display()))
            .and_then(|text| parse_library_list(&text));
        match listed {
            Ok(more) => specs.extend(more),
            Err(e) => {
                out::print_error(&e);
                return EXIT_FAILURE;
            }
        }
    }
    if specs.is_empty() {
        match parse_specs(cfg.verify_libraries.iter().map(String::as_str)) {
            Ok(s) => specs = s,
            Err(e) => {
                out::print_error(&format!("invalid verify_libraries in config: {e}"));
                return EXIT_FAILURE;
            }
        }
    }
    verify_and_report(cfg, &absolute_or_same(root), &specs)
}

fn absolute_or_same(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}

fn verify_and_report(cfg: &Config, root: &Path, libs: &[LibrarySpec]) -> i32 {
    let report = match venv_move::verify::verify(root, libs) {
        Ok(r) => r,
        Err(e) => return report_verify_error(cfg, root, &e),
    };
    print_outcomes(&report, cfg.json);
    let rec = StatusRecord::verified(&report, EXIT_VERIFY_FAILED);
    if let Some(msg) = &rec.message {
        out::print_warn(msg);
    }
    out::print_user(&rec.render(cfg.json));
    rec.code
}

/// One stdout line per library, in request order.
fn print_outcomes(report: &VerifyReport, json: bool) {
    for o in &report.outcomes {
        if json {
            match serde_json::to_string(o) {
                Ok(line) => out::print_user(&line),
                Err(e) => out::print_warn(&format!("cannot encode outcome for {}: {e}", o.library)),
            }
        } else if o.ok {
            out::print_user(&format!("ok\t{}", o.library.label));
        } else {
            out::print_user(&format!(
                "fail\t{}\t{}",
                o.library.label,
                o.error.as_deref().unwrap_or("import failed")
            ));
        }
    }
}

fn report_verify_error(cfg: &Config, root: &Path, err: &VerifyError) -> i32 {
    error!(code = err.code(), kind = err.kind(), root = %root.display(), error = %err, "verification could not run");
    out::print_error(&err.to_string());
    let rec = StatusRecord::verify_error(err, root);
    out::print_user(&rec.render(cfg.json));
    err.code()
}
