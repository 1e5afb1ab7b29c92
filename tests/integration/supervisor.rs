#[path = "common/mod.rs"]
mod common;

use std::{fs, net::TcpListener, process::Command as StdCommand, thread};

use common::{Project, is_process_alive, port_open, wait_for_port, wait_for_process_exit};
use predicates::prelude::*;

#[test]
fn start_status_stop_lifecycle() {
    let project = Project::new();

    project
        .cmd()
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("healthy"));

    let pid = project.pid().expect("pid file should be written");
    assert!(is_process_alive(pid));
    assert!(port_open(project.port));

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], true);
    assert_eq!(state["mode"], "dev");
    assert_eq!(state["port_status"], "listening");
    assert_eq!(state["port"], project.port);

    let output = project.cmd().args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["pid"], pid);
    assert_eq!(status["alive"], true);
    assert!(status["lock_owner"].is_null(), "lock is released after start");

    project
        .cmd()
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Stopped PID {pid}")));

    wait_for_process_exit(pid);
    wait_for_port(project.port, false);
    assert!(!project.runtime_file("clawops.pid").exists());

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], false);
    assert_eq!(state["mode"], "stopped");
}

#[test]
fn stopping_a_stopped_server_succeeds() {
    let project = Project::new();

    for _ in 0..2 {
        project
            .cmd()
            .arg("stop")
            .assert()
            .success()
            .stdout(predicate::str::contains("already stopped"));
    }

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], false);
    assert_eq!(state["mode"], "stopped");
}

#[test]
fn start_refuses_a_foreign_listener_without_force() {
    let project = Project::new();
    let _occupant = TcpListener::bind(("127.0.0.1", project.port)).unwrap();

    project
        .cmd()
        .arg("start")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already in use"));

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], false);
    assert!(state["error"].is_string());
    assert!(project.pid().is_none());
}

#[test]
fn force_start_replaces_the_running_server() {
    let project = Project::new();
    project.cmd().arg("start").assert().success();
    let first = project.pid().unwrap();

    project.cmd().arg("start").assert().code(1);
    assert_eq!(project.pid(), Some(first), "refused start leaves state alone");

    project.cmd().args(["start", "--force"]).assert().success();
    let second = project.pid().unwrap();
    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert!(is_process_alive(second));
}

#[test]
fn restart_keeps_recorded_mode() {
    let project = Project::new();
    project
        .cmd()
        .args(["start", "--mode", "preview"])
        .assert()
        .success();
    assert!(project.dir.join("dist/index.html").exists(), "preview builds first");
    let first = project.pid().unwrap();

    project.cmd().arg("restart").assert().success();
    let second = project.pid().unwrap();
    assert_ne!(first, second);
    assert_eq!(project.read_json("health-state.json")["mode"], "preview");
}

#[test]
fn failing_server_leaves_an_unhealthy_snapshot() {
    let project = Project::with_commands(Some("exit 3"), None);

    project.cmd().arg("start").assert().code(1);

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], false);
    assert!(state["error"].is_string());
    assert!(project.pid().is_none());
}

#[test]
fn build_failure_aborts_preview_start() {
    let project = Project::with_commands(None, Some("exit 7"));

    project
        .cmd()
        .args(["start", "--mode", "preview"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("exit 7"));

    assert!(!port_open(project.port));
    assert!(project.pid().is_none());
}

#[test]
fn live_lock_owner_blocks_start() {
    let project = Project::new();
    fs::create_dir_all(&project.runtime).unwrap();
    fs::write(
        project.runtime_file("clawops.lock"),
        format!("{}\n", std::process::id()),
    )
    .unwrap();

    project.cmd().arg("start").assert().code(3);
    assert!(!port_open(project.port));
    assert!(!project.runtime_file("clawops.pid").exists());
    assert!(!project.runtime_file("health-state.json").exists());
    assert_eq!(
        fs::read_to_string(project.runtime_file("clawops.lock")).unwrap(),
        format!("{}\n", std::process::id()),
        "the owner's lock file is left alone"
    );
}

#[test]
fn concurrent_starts_admit_a_single_owner() {
    let project = Project::new();

    let outcomes: Vec<_> = (0..2)
        .map(|_| {
            let mut cmd = project.cmd();
            cmd.arg("start");
            thread::spawn(move || cmd.output().unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let codes: Vec<_> = outcomes.iter().map(|output| output.status.code()).collect();
    assert_eq!(
        codes.iter().filter(|code| **code == Some(0)).count(),
        1,
        "exactly one start wins: {codes:?}"
    );
    assert!(
        codes.contains(&Some(3)) || codes.contains(&Some(1)),
        "the loser reports contention or an occupied port: {codes:?}"
    );

    let pid = project.pid().expect("winner records its pid");
    assert!(is_process_alive(pid));
    assert!(port_open(project.port));
}

#[test]
fn stale_lock_is_reclaimed() {
    let project = Project::new();
    let mut child = StdCommand::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    fs::create_dir_all(&project.runtime).unwrap();
    fs::write(project.runtime_file("clawops.lock"), format!("{dead_pid}\n")).unwrap();

    project.cmd().arg("start").assert().success();
    assert!(!project.runtime_file("clawops.lock").exists());
}

#[test]
fn clean_start_removes_build_output() {
    let project = Project::new();
    fs::create_dir_all(project.dir.join(".output/server")).unwrap();
    fs::write(project.dir.join(".output/server/index.mjs"), "stale").unwrap();

    project.cmd().args(["start", "--clean"]).assert().success();
    assert!(!project.dir.join(".output").exists());
}
