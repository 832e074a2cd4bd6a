//! Corruption recovery tests for the walkunlock binary.
//!
//! These tests verify the system can handle:
//! - Corrupted ledger files
//! - Corrupted locked-app lists
//! - Undecodable icons
//! - Leftover temp files from interrupted writes

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("walkunlock"))
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

#[test]
fn test_corrupted_ledger_starts_at_zero() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(data_dir.join("step_ledger.json"), "{ invalid json }}}}").unwrap();

    cli()
        .arg("status")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Steps: 0 available"));

    // The next write replaces the corrupted record
    cli()
        .args(["walk", "42"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Steps: 42 available"));

    let contents = fs::read_to_string(data_dir.join("step_ledger.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(record["total_steps"], 42);
}

#[test]
fn test_truncated_ledger_starts_at_zero() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(data_dir.join("step_ledger.json"), r#"{"total_steps": 500, "redee"#).unwrap();

    cli()
        .arg("status")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Steps: 0 available"));
}

#[test]
fn test_corrupted_registry_lists_empty() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(data_dir.join("locked_apps.json"), "[{ not a list").unwrap();

    cli()
        .args(["lock", "list"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("No locked apps."));

    // Locking again starts a fresh list
    cli()
        .args(["lock", "add", "com.example.game", "--name", "Game", "--cost", "30"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    cli()
        .args(["lock", "list"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.game"));
}

#[test]
fn test_bad_icon_does_not_drop_entry() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(
        data_dir.join("locked_apps.json"),
        r#"[
            {"app_id": "com.example.game", "display_name": "Game", "cost_per_minute": 30, "icon": "%%%"},
            {"app_id": "com.example.social", "display_name": "Social", "cost_per_minute": 5}
        ]"#,
    )
    .unwrap();

    cli()
        .args(["lock", "list"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.game"))
        .stdout(predicate::str::contains("com.example.social"));
}

#[test]
fn test_leftover_temp_files_are_ignored() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["walk", "10"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    // A write interrupted before the rename leaves only a temp file behind
    fs::write(data_dir.join(".tmpAbC123"), r#"{"total_steps": 9999"#).unwrap();

    cli()
        .arg("status")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Steps: 10 available"));
}

#[test]
fn test_redeemed_above_total_shows_zero_available() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(
        data_dir.join("step_ledger.json"),
        r#"{"total_steps": 10, "redeemed_steps": 25}"#,
    )
    .unwrap();

    cli()
        .arg("status")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Steps: 0 available (10 earned, 25 redeemed)"));
}
