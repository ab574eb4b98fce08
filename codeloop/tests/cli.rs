//! CLI tests for `codeloop init`, `check`, and `exec`.
//!
//! Spawns the codeloop binary and verifies exit codes. `exec` runs with
//! `cat` as the interpreter so the judged output is the admitted source.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use codeloop::exit_codes;
use codeloop::io::config::{CodeloopConfig, load_config, write_config};

fn codeloop(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_codeloop"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn codeloop")
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = codeloop(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let path = temp.path().join(".codeloop/config.toml");
    assert_eq!(load_config(&path).expect("load"), CodeloopConfig::default());

    let second = codeloop(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&second.stdout).contains("already exists"));
}

#[test]
fn check_admits_and_rejects() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("ok.py"), "print('hello')\n").expect("write");
    fs::write(temp.path().join("bad.py"), "import subprocess\nsubprocess.run('dir', shell=True)\n")
        .expect("write");

    let ok = codeloop(temp.path(), &["check", "ok.py"]);
    assert_eq!(ok.status.code(), Some(exit_codes::OK));

    let bad = codeloop(temp.path(), &["check", "bad.py"]);
    assert_eq!(bad.status.code(), Some(exit_codes::FAILED));
    let stdout = String::from_utf8_lossy(&bad.stdout);
    assert!(stdout.contains("policy violation at line 2"), "{stdout}");
}

#[test]
fn check_missing_file_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = codeloop(temp.path(), &["check", "missing.py"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("codeloop.toml"), "max_retries = \"many\"\n").expect("write");
    fs::write(temp.path().join("ok.py"), "print('hello')\n").expect("write");

    let output = codeloop(temp.path(), &["--config", "codeloop.toml", "check", "ok.py"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
#[test]
fn exec_judges_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cfg = CodeloopConfig::default();
    cfg.execution.interpreter = vec!["cat".to_string()];
    write_config(&temp.path().join("codeloop.toml"), &cfg).expect("write config");
    fs::write(temp.path().join("ok.py"), "print('hello')\n").expect("write");
    fs::write(temp.path().join("bad.py"), "print('Failed to read icon.png')\n").expect("write");

    let ok = codeloop(temp.path(), &["--config", "codeloop.toml", "exec", "ok.py"]);
    assert_eq!(ok.status.code(), Some(exit_codes::OK));

    let bad = codeloop(temp.path(), &["--config", "codeloop.toml", "exec", "bad.py"]);
    assert_eq!(bad.status.code(), Some(exit_codes::FAILED));
    let stdout = String::from_utf8_lossy(&bad.stdout);
    assert!(stdout.contains("failed (output_error_signal)"), "{stdout}");
}
