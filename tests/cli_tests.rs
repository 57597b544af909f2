//! Smoke tests for the `ctopo` binary.
//!
//! Only offline commands are exercised; remote commands need a running node.
#![cfg(feature = "http")]

use assert_cmd::Command;
use clustertopo::config::CONFIGURATION_FILE;
use clustertopo::{StaticConfiguration, persistence};
use predicates::prelude::*;
use tempfile::TempDir;

fn ctopo() -> Command {
    Command::cargo_bin("ctopo").unwrap()
}

fn persisted_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = StaticConfiguration::new(["0", "1"], 2, 1).generate().unwrap();
    let bytes = persistence::encode(&config).unwrap();
    std::fs::write(dir.path().join(CONFIGURATION_FILE), bytes).unwrap();
    dir
}

#[test]
fn test_help_lists_commands() {
    ctopo()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("topology"))
        .stdout(predicate::str::contains("remove-member"))
        .stdout(predicate::str::contains("join-partition"))
        .stdout(predicate::str::contains("set-priority"))
        .stdout(predicate::str::contains("exporter"))
        .stdout(predicate::str::contains("show"));
}

#[test]
fn test_replica_change_reports_unreachable_node() {
    ctopo()
        .args(["--url", "http://127.0.0.1:1", "join-partition", "1", "2", "--priority", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to add replica"));
}

#[test]
fn test_show_reads_persisted_configuration() {
    let dir = persisted_dir();

    ctopo()
        .args(["show", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Cluster Configuration"))
        .stdout(predicate::str::contains("partition 1"));
}

#[test]
fn test_show_json() {
    let dir = persisted_dir();

    let output = ctopo()
        .args(["show", "--json", "--data-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["version"], 1);
    assert_eq!(value["partition_config"]["partition_count"], 2);
}

#[test]
fn test_show_without_configuration_fails() {
    let dir = TempDir::new().unwrap();

    ctopo()
        .args(["show", "--data-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No configuration"));
}

#[test]
fn test_apply_rejects_malformed_operations() {
    ctopo()
        .args(["apply", "[{\"NotAnOperation\": {}}]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid operation list"));
}

#[test]
fn test_start_rejects_malformed_peer() {
    ctopo()
        .args(["start", "0", "--peer", "missing-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("<member-id>=<address>"));
}
