#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{Project, is_process_alive, port_open, wait_for_path, wait_for_process_exit};
use predicates::prelude::*;

#[test]
fn single_cycle_on_healthy_server_resets_failures() {
    let project = Project::new();
    project.cmd().arg("start").assert().success();

    project
        .cmd()
        .args(["watchdog", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("action: none"));

    let state = project.read_json("watchdog-state.json");
    assert_eq!(state["consecutive_failures"], 0);
}

#[test]
fn restarts_after_threshold_consecutive_failures() {
    let project = Project::new();

    project
        .cmd()
        .args(["watchdog", "--once", "--threshold", "2"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("action: wait"));
    assert_eq!(project.read_json("watchdog-state.json")["consecutive_failures"], 1);
    assert!(!port_open(project.port), "below threshold nothing restarts");

    project
        .cmd()
        .args(["watchdog", "--once", "--threshold", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("action: restart"));

    assert!(port_open(project.port));
    assert!(project.pid().is_some());
    let state = project.read_json("watchdog-state.json");
    assert_eq!(state["consecutive_failures"], 0);
    assert_eq!(state["last_action"], "restart");
}

#[test]
fn dry_run_reports_without_side_effects() {
    let project = Project::new();

    project
        .cmd()
        .args(["watchdog", "--once", "--dry-run", "--threshold", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("[dry-run]"))
        .stderr(predicate::str::contains("would restart the server now"));

    assert!(!project.runtime_file("watchdog-state.json").exists());
    assert!(!project.runtime_file("health-state.json").exists());
    assert!(!port_open(project.port));
}

#[test]
fn status_without_a_running_watchdog() {
    let project = Project::new();
    project
        .cmd()
        .args(["watchdog", "--status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Watchdog not running"))
        .stdout(predicate::str::contains("Consecutive failures: 0"));

    project
        .cmd()
        .args(["watchdog", "--stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Watchdog is not running"));
}

#[test]
fn daemonized_watchdog_is_single_instance_and_stoppable() {
    let project = Project::new();
    project.cmd().arg("start").assert().success();

    project
        .cmd()
        .args(["watchdog", "--daemonize", "--interval", "1"])
        .assert()
        .success();

    let pid_file = project.runtime_file("watchdog.pid");
    wait_for_path(&pid_file);
    let pid: u32 = fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(is_process_alive(pid));

    project
        .cmd()
        .args(["watchdog", "--daemonize"])
        .assert()
        .code(3);

    project
        .cmd()
        .args(["watchdog", "--status"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Watchdog running (PID {pid})")));

    project.cmd().args(["watchdog", "--stop"]).assert().success();
    wait_for_process_exit(pid);
    assert!(!pid_file.exists());

    let log = fs::read_to_string(project.runtime_file("logs/watchdog.log")).unwrap();
    assert!(log.contains("Watchdog running"));
}
