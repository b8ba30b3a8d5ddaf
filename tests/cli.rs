//! CLI smoke tests for the `pentest` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn pentest() -> Command {
    let mut cmd = cargo_bin_cmd!("pentest");
    cmd.env_remove("PENTEST_CONFIG")
        .env_remove("PENTEST_DB_PATH")
        .env_remove("PENTEST_LLM_URL")
        .env_remove("PENTEST_LLM_MODEL")
        .env_remove("PENTEST_PORT");
    cmd
}

#[test]
fn test_help_lists_commands() {
    pentest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("scan"));
}

#[test]
fn test_version() {
    pentest().arg("--version").assert().success();
}

#[test]
fn test_init_writes_config_and_database() {
    let dir = TempDir::new().unwrap();

    pentest()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));

    let config = fs::read_to_string(dir.path().join("pentest.toml")).unwrap();
    assert!(config.contains("[llm]"));
    assert!(config.contains("nmap"));
    assert!(dir.path().join(".pentest/pentest.db").exists());

    // A second init keeps the existing file.
    pentest()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn test_config_validate_reads_local_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pentest.toml"),
        "[llm]\nmodel = \"llama3\"\n\n[tools]\nexploit = []\n",
    )
    .unwrap();

    pentest()
        .current_dir(dir.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 exploit"))
        .stdout(predicate::str::contains("llama3"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pentest.toml"),
        "[runner]\ndefault_timeout_secs = 0\n",
    )
    .unwrap();

    pentest()
        .current_dir(dir.path())
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("default_timeout_secs"));
}

#[test]
fn test_scan_rejects_unparseable_url() {
    let dir = TempDir::new().unwrap();
    pentest()
        .current_dir(dir.path())
        .args(["scan", "http://"])
        .assert()
        .failure();
}
