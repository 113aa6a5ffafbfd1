#![cfg(unix)]
//! Runs in its own test binary: the shutdown flag is process-wide and one-way.

use std::fs;

use tempfile::tempdir;
use venv_move::{RelocateOptions, lock_file_path, relocate, shutdown};

#[test]
fn interrupt_rolls_back_and_reports_interrupted() {
    let td = tempdir().unwrap();
    let base = fs::canonicalize(td.path()).unwrap();
    let src = base.join("src/venv");
    let dst = base.join("dst/venv");
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::write(src.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
    fs::write(src.join("bin/activate"), format!("VIRTUAL_ENV='{}'\n", src.display())).unwrap();

    shutdown::request();
    let err = relocate(&src, &dst, &RelocateOptions::default()).unwrap_err();

    assert_eq!(err.kind(), "interrupted");
    assert_eq!(err.code(), 17);
    assert!(!dst.exists());
    assert!(!lock_file_path(&dst).exists());
    assert!(src.join("bin/activate").is_file());
}
