//! CLI smoke tests for the apkwright binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn apkwright() -> Command {
    Command::cargo_bin("apkwright").unwrap()
}

#[test]
fn test_help() {
    apkwright()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build server"));
}

#[test]
fn test_version() {
    apkwright().arg("--version").assert().success();
}

#[test]
fn test_requires_subcommand() {
    apkwright().assert().failure();
}

#[test]
fn test_init_db_creates_data_tree() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");

    apkwright()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("init-db")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    assert!(data_dir.join("apkwright.db").is_file());
    assert!(data_dir.join("snapshots").is_dir());
    assert!(data_dir.join("uploads").is_dir());
}

#[test]
fn test_init_db_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");

    for _ in 0..2 {
        apkwright()
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("init-db")
            .assert()
            .success();
    }
}
