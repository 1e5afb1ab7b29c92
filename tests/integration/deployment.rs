#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{Project, port_open};
use predicates::prelude::*;

fn actions(project: &Project) -> Vec<(String, String)> {
    project
        .journal()
        .iter()
        .map(|entry| {
            (
                entry["action"].as_str().unwrap().to_string(),
                entry["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

fn last_deploy_tx(project: &Project) -> String {
    project
        .journal()
        .iter()
        .rev()
        .find(|entry| entry["action"] == "deploy_complete" && entry["status"] == "success")
        .and_then(|entry| entry["tx_id"].as_str().map(str::to_string))
        .expect("no successful deploy recorded")
}

#[test]
fn init_is_idempotent() {
    let project = Project::new();

    for _ in 0..2 {
        project
            .cmd()
            .args(["deploy", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
    }

    assert!(project.runtime_file("deploy/journal.jsonl").exists());
    assert!(project.runtime_file("deploy/backups").is_dir());
    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "initialized");
    assert_eq!(current["version"], "1.2.3");
    assert!(project.journal().is_empty());
}

#[test]
fn successful_deploy_journals_every_phase() {
    let project = Project::new();
    project.cmd().args(["deploy", "init"]).assert().success();

    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build", "--health-target", "app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deployed 1.2.3 as tx-"));

    let expected = [
        ("deploy_start", "started"),
        ("backup_created", "success"),
        ("build_start", "started"),
        ("build_complete", "success"),
        ("server_start", "success"),
        ("health_check", "success"),
        ("deploy_complete", "success"),
    ];
    assert_eq!(
        actions(&project),
        expected
            .iter()
            .map(|(a, s)| (a.to_string(), s.to_string()))
            .collect::<Vec<_>>()
    );

    let journal = project.journal();
    let tx = journal[0]["tx_id"].as_str().unwrap();
    assert!(journal.iter().all(|entry| entry["tx_id"] == tx));

    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "deployed");
    assert_eq!(current["transaction_id"], tx);
    assert!(project.runtime_file(&format!("deploy/backups/{tx}/metadata.json")).exists());
    assert!(port_open(project.port));
}

#[test]
fn deploy_checks_the_contract_endpoint_by_default() {
    let project = Project::new();
    let _endpoint = project.spawn_endpoint();

    project.cmd().args(["deploy", "deploy"]).assert().success();
    let check = project
        .journal()
        .into_iter()
        .find(|entry| entry["action"] == "health_check")
        .unwrap();
    assert_eq!(check["status"], "success");
    assert_eq!(check["details"]["target"], "contract");
    assert_eq!(check["details"]["port"], project.health_port);
}

#[test]
fn contract_check_without_endpoint_fails_and_rolls_back() {
    let project = Project::new();
    project.cmd().args(["deploy", "init"]).assert().success();
    project
        .cmd()
        .args(["deploy", "deploy", "--no-health-check"])
        .assert()
        .success();
    let good = last_deploy_tx(&project);

    project
        .cmd()
        .args(["deploy", "deploy", "--timeout", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("health_check"));

    let journal = project.journal();
    let last = journal.last().unwrap();
    assert_eq!(last["action"], "rollback");
    assert_eq!(last["status"], "success");
    assert_eq!(last["details"]["restored_to"], good.as_str());
    assert_eq!(last["details"]["backup"], last["tx_id"]);
    assert_ne!(last["tx_id"], good.as_str());

    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "rolled_back");
    assert_eq!(current["transaction_id"], good.as_str());
    assert!(port_open(project.port), "rollback restarts the server");
}

#[test]
fn unusable_health_target_is_journaled_and_rolled_back() {
    let project = Project::new();
    project
        .cmd()
        .args(["deploy", "deploy", "--no-health-check"])
        .assert()
        .success();
    let good = last_deploy_tx(&project);

    project.set_health_port(project.port);
    project
        .cmd()
        .args(["deploy", "deploy"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot share it"));

    let tail: Vec<_> = actions(&project).into_iter().rev().take(2).collect();
    assert_eq!(tail[0], ("rollback".into(), "success".into()));
    assert_eq!(tail[1], ("health_check".into(), "failed".into()));

    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "rolled_back");
    assert_eq!(current["transaction_id"], good.as_str());
}

#[test]
fn failed_build_restores_previous_artifacts() {
    let project = Project::new();
    project.set_build("mkdir -p dist && echo v1 > dist/index.html");
    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build", "--health-target", "app"])
        .assert()
        .success();
    let good = last_deploy_tx(&project);

    project.set_build("mkdir -p dist && echo broken > dist/index.html && exit 1");
    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build", "--health-target", "app"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("build"));

    assert_eq!(
        fs::read_to_string(project.dir.join("dist/index.html")).unwrap(),
        "v1\n"
    );

    let tail: Vec<_> = actions(&project).into_iter().rev().take(3).collect();
    assert_eq!(tail[0], ("rollback".into(), "success".into()));
    assert_eq!(tail[1], ("build_complete".into(), "failed".into()));
    assert_eq!(tail[2], ("build_start".into(), "started".into()));

    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "rolled_back");
    assert_eq!(current["transaction_id"], good.as_str());
    assert!(port_open(project.port));
}

#[test]
fn failure_without_prior_success_leaves_state_untouched() {
    let project = Project::with_commands(None, Some("exit 1"));
    project.cmd().args(["deploy", "init"]).assert().success();

    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Rollback failed"));

    let journal = project.journal();
    let last = journal.last().unwrap();
    assert_eq!(last["action"], "rollback");
    assert_eq!(last["status"], "failed");
    assert_eq!(last["details"]["reason"], "no_prior_success");
    assert_eq!(project.read_json("deploy/current.json")["status"], "initialized");
}

#[test]
fn manual_rollback_restores_the_last_deploy_backup() {
    let project = Project::new();
    project.set_build("mkdir -p dist && echo v1 > dist/index.html");
    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build", "--no-health-check"])
        .assert()
        .success();

    project.set_build("mkdir -p dist && echo v2 > dist/index.html");
    project
        .cmd()
        .args(["deploy", "deploy", "--pre-build", "--no-health-check"])
        .assert()
        .success();
    let second = last_deploy_tx(&project);
    assert_eq!(
        fs::read_to_string(project.dir.join("dist/index.html")).unwrap(),
        "v2\n"
    );

    project
        .cmd()
        .args(["deploy", "rollback"])
        .assert()
        .success()
        .stdout(predicate::str::contains(second.as_str()));

    assert_eq!(
        fs::read_to_string(project.dir.join("dist/index.html")).unwrap(),
        "v1\n"
    );
    let current = project.read_json("deploy/current.json");
    assert_eq!(current["status"], "rolled_back");
    assert_eq!(current["transaction_id"], second.as_str());

    let last = project.journal().pop().unwrap();
    assert_eq!(last["action"], "manual_rollback");
    assert_eq!(last["status"], "success");
    assert!(port_open(project.port));
}

#[test]
fn manual_rollback_to_unknown_transaction_fails() {
    let project = Project::new();
    project.cmd().args(["deploy", "init"]).assert().success();

    project
        .cmd()
        .args(["deploy", "rollback", "--to", "tx-unknown"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No backup found"));
}

#[test]
fn read_only_views() {
    let project = Project::new();
    project.cmd().args(["deploy", "init"]).assert().success();
    project
        .cmd()
        .args(["deploy", "deploy", "--no-health-check"])
        .assert()
        .success();

    project
        .cmd()
        .args(["deploy", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: deployed"))
        .stdout(predicate::str::contains("Backups: 1"));

    let output = project.cmd().args(["deploy", "journal", "2"]).output().unwrap();
    assert!(output.status.success());
    let lines: Vec<_> = String::from_utf8(output.stdout).unwrap().lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 2);
    let last: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(last["action"], "deploy_complete");

    project
        .cmd()
        .args(["deploy", "verify"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("2 issue(s)"));

    let _endpoint = project.spawn_endpoint();
    project
        .cmd()
        .args(["deploy", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 issue(s)"));
}

#[test]
fn old_backups_are_pruned() {
    let project = Project::new();
    for _ in 0..6 {
        project
            .cmd()
            .args(["deploy", "deploy", "--no-health-check"])
            .assert()
            .success();
    }

    let backups = fs::read_dir(project.runtime_file("deploy/backups"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .count();
    assert_eq!(backups, 5);

    let first_tx = project.journal()[0]["tx_id"].as_str().unwrap().to_string();
    assert!(!project.runtime_file(&format!("deploy/backups/{first_tx}")).exists());
}
