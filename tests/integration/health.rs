#[path = "common/mod.rs"]
mod common;

use std::net::TcpListener;

use common::Project;
use predicates::prelude::*;

fn get(port: u16, path: &str) -> (u16, serde_json::Value) {
    let response = reqwest::blocking::get(format!("http://127.0.0.1:{port}{path}"))
        .expect("endpoint should answer");
    let status = response.status().as_u16();
    (status, response.json().expect("json body"))
}

#[test]
fn health_of_a_stopped_server_is_unhealthy() {
    let project = Project::new();

    let output = project.cmd().args(["health", "--json"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["healthy"], false);
    assert_eq!(state["port_status"], "not_listening");
    assert_eq!(state["http_status"], "unknown");
    assert!(state["pid"].is_null());

    assert!(
        !project.runtime_file("health-state.json").exists(),
        "a plain check does not persist"
    );
}

#[test]
fn health_reports_running_server_and_persists_on_request() {
    let project = Project::new();
    project.cmd().arg("start").assert().success();
    let pid = project.pid().unwrap();

    project
        .cmd()
        .args(["health", "--state"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("healthy"))
        .stdout(predicate::str::contains(format!("pid={pid}")));

    let state = project.read_json("health-state.json");
    assert_eq!(state["healthy"], true);
    assert_eq!(state["http_status"], "healthy");
}

#[test]
fn silent_listener_is_listening_but_http_unhealthy() {
    let project = Project::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let output = project
        .cmd()
        .args(["health", "--json", "--port", &port.to_string()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["port_status"], "listening");
    assert_eq!(state["http_status"], "unhealthy");
    assert_eq!(state["healthy"], false);
    drop(listener);
}

#[test]
fn invalid_port_is_a_usage_error() {
    let project = Project::new();
    project
        .cmd()
        .args(["health", "--port", "0"])
        .assert()
        .code(2);
}

#[test]
fn contract_endpoint_tracks_the_target() {
    let project = Project::new();
    let _endpoint = project.spawn_endpoint();

    let (status, body) = get(project.health_port, "/live");
    assert_eq!(status, 200);
    assert_eq!(body["alive"], true);

    let (status, body) = get(project.health_port, "/ready");
    assert_eq!(status, 503);
    assert_eq!(body["ready"], false);

    let (status, body) = get(project.health_port, "/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"]["healthy"], false);
    assert_eq!(body["service"]["version"], "1.2.3");

    project.cmd().arg("start").assert().success();

    let (status, body) = get(project.health_port, "/ready");
    assert_eq!(status, 200);
    assert_eq!(body["ready"], true);

    let (_, body) = get(project.health_port, "/");
    assert_eq!(body["contract_version"], "1.0");
    assert_eq!(body["status"]["healthy"], true);
    assert_eq!(body["status"]["port_status"], "listening");
    assert_eq!(body["service"]["mode"], "dev");
    assert_eq!(
        body["checks"]["port"]["target"],
        format!("127.0.0.1:{}", project.port)
    );

    let (_, body) = get(project.health_port, "/version");
    assert_eq!(body["service"], "clawsuite");
}

#[test]
fn endpoint_refuses_to_listen_on_its_target() {
    let project = Project::new();
    project
        .cmd()
        .args(["endpoint", "--listen-port", &project.port.to_string()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot listen on its target"));
}

#[test]
fn stand_in_server_answers_promptly() {
    let project = Project::new();
    project.cmd().arg("start").assert().success();

    let started = std::time::Instant::now();
    let (status, body) = get(project.port, "/");
    assert_eq!(status, 200);
    assert_eq!(body["status"]["port_status"], "not_listening");
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}
