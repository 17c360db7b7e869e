//! CLI surface smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn capstan() -> Command {
    Command::cargo_bin("capstan").expect("binary built")
}

#[test]
fn machine_prints_statechart_json() {
    capstan()
        .arg("machine")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"initial\": \"draft\""))
        .stdout(predicate::str::contains("PUBLISH_COMPLETE"));
}

#[test]
fn status_without_runs_fails_cleanly() {
    let temp = tempfile::TempDir::new().unwrap();
    capstan()
        .args(["--repo", temp.path().to_str().unwrap(), "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run not found"));
}

#[test]
fn plan_outside_a_repository_fails_cleanly() {
    let temp = tempfile::TempDir::new().unwrap();
    capstan()
        .args([
            "--repo",
            temp.path().to_str().unwrap(),
            "--actor",
            "tester",
            "plan",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a git repository"));
}

#[test]
fn bad_run_id_rejected() {
    let temp = tempfile::TempDir::new().unwrap();
    capstan()
        .args([
            "--repo",
            temp.path().to_str().unwrap(),
            "status",
            "--run",
            "../escape",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --run"));
}

#[test]
fn help_lists_lifecycle_commands() {
    capstan()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("approve"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("retry"));
}
