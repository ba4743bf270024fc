//! CLI smoke tests for the offline commands.

#![allow(clippy::panic)]

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("switchboard-rs").unwrap_or_else(|e| panic!("binary not built: {e}"))
}

#[test]
fn chunk_command_reports_boundaries() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "First sentence. Second sentence. Third sentence.")
        .unwrap_or_else(|_| unreachable!());

    cmd()
        .args(["chunk"])
        .arg(&file)
        .args(["--size", "20", "--overlap", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks from"));
}

#[test]
fn chunk_command_json_output_is_parseable() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "Alpha beta. Gamma delta.").unwrap_or_else(|_| unreachable!());

    let output = cmd()
        .args(["--format", "json", "chunk"])
        .arg(&file)
        .output()
        .unwrap_or_else(|e| panic!("run failed: {e}"));
    assert!(output.status.success());
    let rows: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap_or_else(|e| panic!("bad json: {e}"));
    assert!(rows.as_array().is_some_and(|a| !a.is_empty()));
}

#[test]
fn chunk_command_missing_file_fails() {
    cmd()
        .args(["chunk", "/nonexistent/definitely-missing.txt"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn route_command_selects_and_persists_history() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());

    cmd()
        .args(["--state-dir"])
        .arg(dir.path())
        .args(["route", "--task", "classification", "--priority", "cost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("selected:"));

    let history = dir.path().join(".routing-history.json");
    assert!(history.exists(), "routing history was not persisted");
    let telemetry = dir.path().join(".model-telemetry.json");
    assert!(telemetry.exists(), "telemetry was not persisted");
}

#[test]
fn route_command_rejects_unknown_task() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    cmd()
        .args(["--state-dir"])
        .arg(dir.path())
        .args(["route", "--task", "divination"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown task"));
}

#[test]
fn stats_command_reads_back_decisions() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());

    for _ in 0..2 {
        cmd()
            .args(["--state-dir"])
            .arg(dir.path())
            .args(["route", "--task", "chat", "--priority", "speed"])
            .assert()
            .success();
    }

    let output = cmd()
        .args(["--state-dir"])
        .arg(dir.path())
        .args(["--format", "json", "stats"])
        .output()
        .unwrap_or_else(|e| panic!("run failed: {e}"));
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap_or_else(|e| panic!("bad json: {e}"));
    assert_eq!(report["summary"]["total_decisions"], 2);
    assert_eq!(report["priority_distribution"]["speed"], 2);
}

#[test]
fn extract_without_api_key_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
    let file = dir.path().join("doc.txt");
    std::fs::write(&file, "Some document body.").unwrap_or_else(|_| unreachable!());

    cmd()
        .env_remove("OPENAI_API_KEY")
        .env_remove("SWB_API_KEY")
        .args(["--state-dir"])
        .arg(dir.path())
        .args(["extract"])
        .arg(&file)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("API key missing"));
}
