#![cfg(unix)]

use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

use venv_move::config::load_config;
use venv_move::{CONFIG_ENV_VAR, LogLevel, default_config_path};

fn write_config(path: &Path, body: &str) {
    fs::write(path, format!("<config>\n{body}\n</config>\n")).unwrap();
}

#[test]
#[serial]
fn env_var_points_load_config_at_file() {
    let td = tempdir().unwrap();
    let cfg = td.path().join("custom.xml");
    write_config(
        &cfg,
        "  <log_level>info</log_level>\n  <disable_locks>true</disable_locks>\n  <verify_libraries><library>pip</library></verify_libraries>",
    );

    unsafe { std::env::set_var(CONFIG_ENV_VAR, &cfg) };
    let resolved = default_config_path().unwrap();
    let loaded = load_config();
    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };

    assert_eq!(resolved, cfg);
    let (config, from) = loaded.unwrap().expect("config file exists");
    assert_eq!(from, cfg);
    assert_eq!(config.log_level, LogLevel::Info);
    assert!(config.disable_locks);
    assert_eq!(config.verify_libraries, vec!["pip"]);
}

#[test]
#[serial]
fn absent_file_means_defaults() {
    let td = tempdir().unwrap();
    unsafe { std::env::set_var(CONFIG_ENV_VAR, td.path().join("missing.xml")) };
    let loaded = load_config();
    unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
    assert!(loaded.unwrap().is_none());
}

#[test]
fn binary_honours_metadata_file_and_log_file_from_config() {
    let td = tempdir().unwrap();
    let base = fs::canonicalize(td.path()).unwrap();
    let src = base.join("src/env");
    let dst = base.join("dst/env");
    let log = base.join("logs/venv_move.log");
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(src.join("env.cfg"), format!("home = /usr/bin\nprefix = {}\n", src.display())).unwrap();
    let tool = src.join("bin/tool");
    fs::write(&tool, format!("#!{}/bin/python\nprint('hi')\n", src.display())).unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

    let cfg = base.join("config.xml");
    write_config(
        &cfg,
        &format!(
            "  <log_level>info</log_level>\n  <log_file>{}</log_file>\n  <metadata_file>env.cfg</metadata_file>",
            log.display()
        ),
    );

    let me = assert_cmd::cargo::cargo_bin!("venv_move");
    let out = Command::new(me)
        .args(["relocate", src.to_str().unwrap(), dst.to_str().unwrap()])
        .env(CONFIG_ENV_VAR, &cfg)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("sites=2"));
    assert_eq!(
        fs::read_to_string(dst.join("env.cfg")).unwrap(),
        format!("home = /usr/bin\nprefix = {}\n", dst.display())
    );

    let logged = fs::read_to_string(&log).unwrap();
    assert!(logged.contains("relocation committed"), "log was: {logged}");
}

#[test]
fn malformed_config_is_a_generic_failure() {
    let td = tempdir().unwrap();
    let cfg = td.path().join("bad.xml");
    write_config(&cfg, "  <completed_base>/x</completed_base>");

    let me = assert_cmd::cargo::cargo_bin!("venv_move");
    let out = Command::new(me)
        .args(["verify", td.path().to_str().unwrap()])
        .env(CONFIG_ENV_VAR, &cfg)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}

#[test]
fn relocate_ignores_configured_verify_libraries() {
    let td = tempdir().unwrap();
    let base = fs::canonicalize(td.path()).unwrap();
    let src = base.join("src/env");
    let dst = base.join("dst/env");
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::write(src.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();

    let cfg = base.join("config.xml");
    write_config(&cfg, "  <verify_libraries><library>missing_mod</library></verify_libraries>");

    let me = assert_cmd::cargo::cargo_bin!("venv_move");
    let out = Command::new(me)
        .args(["relocate", src.to_str().unwrap(), dst.to_str().unwrap()])
        .env(CONFIG_ENV_VAR, &cfg)
        .output()
        .unwrap();
    // No interpreter exists here, so any verification attempt would exit 21.
    assert_eq!(out.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.lines().count(), 1, "{stdout}");
    assert!(stdout.starts_with("status=committed mode=copy code=0"), "{stdout}");
}
