#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::Project;
use predicates::prelude::*;

#[test]
fn help_lists_lifecycle_commands() {
    Command::new(assert_cmd::cargo::cargo_bin!("clawops"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("watchdog"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("endpoint"));
}

#[test]
fn unknown_mode_exits_with_config_code() {
    let project = Project::new();
    project
        .cmd()
        .args(["start", "--mode", "staging"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid mode"));
}

#[test]
fn malformed_config_exits_with_config_code() {
    let project = Project::new();
    fs::write(project.dir.join("clawops.yaml"), "port: [not a port\n").unwrap();

    project
        .cmd()
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid config file"));
}

#[test]
fn invalid_port_override_from_environment() {
    let project = Project::new();
    project
        .cmd()
        .env("CLAWSUITE_PORT", "not-a-port")
        .arg("status")
        .assert()
        .code(2);
}

#[test]
fn port_override_from_environment_is_honoured() {
    let project = Project::new();
    let output = project
        .cmd()
        .env("CLAWSUITE_PORT", "1")
        .args(["health", "--json"])
        .output()
        .unwrap();
    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["port"], 1);
}

#[test]
fn status_without_state() {
    let project = Project::new();
    project
        .cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No PID recorded"))
        .stdout(predicate::str::contains("No health snapshot recorded"));
}

#[test]
fn logs_show_the_tail_of_the_server_log() {
    let project = Project::new();
    fs::create_dir_all(project.runtime_file("logs")).unwrap();
    fs::write(
        project.runtime_file("logs/server.log"),
        "line one\nline two\nline three\n",
    )
    .unwrap();

    project
        .cmd()
        .args(["logs", "--lines", "2"])
        .assert()
        .success()
        .stdout("line two\nline three\n");
}

#[test]
fn missing_project_directory_is_rejected() {
    Command::new(assert_cmd::cargo::cargo_bin!("clawops"))
        .args(["--project-dir", "/nonexistent/clawops-project", "status"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not accessible"));
}
