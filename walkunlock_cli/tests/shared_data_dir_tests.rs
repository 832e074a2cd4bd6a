//! Tests for a `run` session sharing its data directory with other commands.
//!
//! These tests verify that edits made from another shell while `run` is live:
//! - Are not overwritten by the running service
//! - Reach the running enforcer

use assert_cmd::Command;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("walkunlock"))
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn spawn_run(data_dir: &Path) -> Child {
    std::process::Command::new(assert_cmd::cargo::cargo_bin!("walkunlock"))
        .arg("run")
        .arg("--data-dir")
        .arg(data_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start run")
}

fn send(child: &mut Child, line: &str) {
    let stdin = child.stdin.as_mut().expect("stdin is piped");
    writeln!(stdin, "{}", line).unwrap();
    stdin.flush().unwrap();
}

fn finish(mut child: Child) -> String {
    send(&mut child, "status");
    send(&mut child, "quit");
    drop(child.stdin.take());
    let output = child.wait_with_output().expect("run should exit");
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

fn run_cmd(data_dir: &Path, args: &[&str]) {
    cli()
        .args(args)
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();
}

#[test]
fn test_steps_walked_elsewhere_are_spendable_in_run() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    run_cmd(data_dir, &["lock", "add", "com.example.game", "--name", "Game", "--cost", "30"]);

    let mut child = spawn_run(data_dir);
    send(&mut child, "fg com.example.game");
    thread::sleep(Duration::from_millis(300));

    run_cmd(data_dir, &["walk", "100"]);
    send(&mut child, "steps 5");
    send(&mut child, "retry");
    let stdout = finish(child);

    assert!(stdout.contains("Tracking: com.example.game"), "{}", stdout);
    assert!(stdout.contains("Steps: 105 available"), "{}", stdout);

    cli()
        .args(["status", "--json"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicates::str::contains("\"total\": 105"));
}

#[test]
fn test_reset_elsewhere_is_not_undone_by_run() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    run_cmd(data_dir, &["walk", "80"]);

    let mut child = spawn_run(data_dir);
    send(&mut child, "status");
    thread::sleep(Duration::from_millis(300));

    run_cmd(data_dir, &["reset", "--yes"]);
    send(&mut child, "steps 7");
    let stdout = finish(child);

    assert!(stdout.contains("Steps: 7 available (7 earned, 0 redeemed)"), "{}", stdout);
}

#[test]
fn test_unlock_elsewhere_stops_tracking_in_run() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    run_cmd(data_dir, &["lock", "add", "com.example.game", "--name", "Game", "--cost", "30"]);
    run_cmd(data_dir, &["walk", "100"]);

    let mut child = spawn_run(data_dir);
    send(&mut child, "fg com.example.game");
    thread::sleep(Duration::from_millis(300));

    run_cmd(data_dir, &["lock", "remove", "com.example.game"]);
    // Longer than the default directory watch interval
    thread::sleep(Duration::from_millis(2_000));
    let stdout = finish(child);

    assert!(stdout.contains("Foreground: com.example.game"), "{}", stdout);
    assert!(stdout.contains("Tracking: none"), "{}", stdout);
}
