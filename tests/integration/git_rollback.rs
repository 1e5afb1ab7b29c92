#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    process::{Command as StdCommand, Stdio},
};

use common::{Project, port_open};
use predicates::prelude::*;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(["-c", "user.name=ops", "-c", "user.email=ops@example.com"])
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .expect("git should be installed");
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// Commits the project twice; returns (first, second) hashes.
fn versioned_project() -> (Project, String, String) {
    let project = Project::new();
    git(&project.dir, &["init", "-q"]);
    fs::write(project.dir.join("app.txt"), "v1\n").unwrap();
    git(&project.dir, &["add", "."]);
    git(&project.dir, &["commit", "-q", "-m", "first"]);
    let first = git(&project.dir, &["rev-parse", "HEAD"]);

    fs::write(project.dir.join("app.txt"), "v2\n").unwrap();
    git(&project.dir, &["commit", "-q", "-am", "second"]);
    let second = git(&project.dir, &["rev-parse", "HEAD"]);
    (project, first, second)
}

#[test]
fn outside_a_repository_is_a_config_error() {
    let project = Project::new();
    project
        .cmd()
        .arg("rollback")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not a git checkout"));
}

#[test]
fn dry_run_prints_the_plan_only() {
    let (project, first, second) = versioned_project();

    project
        .cmd()
        .args(["rollback", "--dry-run", "--mode", "preview"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Plan: {} -> {} (mode: preview, port: {})",
            &second[..12],
            &first[..12],
            project.port
        )));

    assert_eq!(git(&project.dir, &["rev-parse", "HEAD"]), second);
    assert!(!project.runtime_file("rollback-state.json").exists());
    assert!(!port_open(project.port));
}

#[test]
fn dirty_tree_is_refused_without_force() {
    let (project, _, second) = versioned_project();
    fs::write(project.dir.join("app.txt"), "local edit\n").unwrap();

    project
        .cmd()
        .arg("rollback")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("uncommitted changes"));

    assert_eq!(git(&project.dir, &["rev-parse", "HEAD"]), second);
    assert_eq!(
        fs::read_to_string(project.dir.join("app.txt")).unwrap(),
        "local edit\n"
    );
    assert_eq!(project.read_json("rollback-state.json")["status"], "failed");
}

#[test]
fn rollback_checks_out_and_restarts() {
    let (project, first, _) = versioned_project();
    fs::write(project.dir.join("app.txt"), "local edit\n").unwrap();

    project
        .cmd()
        .args(["rollback", "--steps", "1", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rollback success"));

    assert_eq!(git(&project.dir, &["rev-parse", "HEAD"]), first);
    assert_eq!(fs::read_to_string(project.dir.join("app.txt")).unwrap(), "v1\n");
    assert!(port_open(project.port));

    let state = project.read_json("rollback-state.json");
    assert_eq!(state["status"], "success");
    assert_eq!(state["to"], first.as_str());
    assert_eq!(state["health"]["healthy"], true);
}

#[test]
fn rollback_to_current_commit_is_a_noop() {
    let (project, _, second) = versioned_project();

    project
        .cmd()
        .args(["rollback", "--to", "HEAD"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rollback noop"));

    assert_eq!(git(&project.dir, &["rev-parse", "HEAD"]), second);
    assert_eq!(project.read_json("rollback-state.json")["status"], "noop");
    assert!(!port_open(project.port));
}

#[test]
fn invalid_targets_are_rejected() {
    let (project, _, _) = versioned_project();

    project
        .cmd()
        .args(["rollback", "--steps", "0"])
        .assert()
        .code(2);
    project
        .cmd()
        .args(["rollback", "--to", "no-such-ref"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown git reference"));
    project
        .cmd()
        .args(["rollback", "--steps", "5"])
        .assert()
        .code(2);
}
