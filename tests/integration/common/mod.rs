#![allow(dead_code)]

use std::{
    fs,
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;

/// A scratch dashboard project whose "server" is `clawops endpoint`, which
/// answers 200 on `/` and therefore looks like a healthy dashboard.
pub struct Project {
    _temp: TempDir,
    pub dir: PathBuf,
    pub runtime: PathBuf,
    pub port: u16,
    pub health_port: u16,
}

impl Project {
    pub fn new() -> Self {
        Self::with_commands(None, None)
    }

    /// Overrides the dev command and/or the build command.
    pub fn with_commands(dev: Option<&str>, build: Option<&str>) -> Self {
        let temp = tempfile::tempdir().expect("failed to create tempdir");
        let dir = temp.path().join("project");
        let runtime = temp.path().join("runtime");
        fs::create_dir_all(&dir).expect("failed to create project dir");

        let port = free_port();
        let health_port = free_port();
        let server = server_command();
        let dev = dev.map(str::to_string).unwrap_or_else(|| server.clone());
        let build = build.unwrap_or("mkdir -p dist && date > dist/index.html");

        fs::write(
            dir.join("clawops.yaml"),
            format!(
                r#"host: 127.0.0.1
port: {port}
health_port: {health_port}
commands:
  dev: "{dev}"
  preview: "{server}"
  build: "{build}"
  install: "true"
health_wait:
  attempts: 40
  interval_ms: 250
http_timeout_secs: 2
"#
            ),
        )
        .expect("failed to write config");
        fs::write(dir.join("package.json"), r#"{"name":"dash","version":"1.2.3"}"#)
            .expect("failed to write package.json");

        Self {
            _temp: temp,
            dir,
            runtime,
            port,
            health_port,
        }
    }

    /// `clawops` pointed at this project and runtime directory.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("clawops"));
        cmd.arg("--project-dir")
            .arg(&self.dir)
            .arg("--runtime-dir")
            .arg(&self.runtime)
            .env_remove("CLAWSUITE_PORT")
            .env_remove("CLAWSUITE_HOST")
            .env_remove("CLAWSUITE_HEALTH_PORT")
            .env_remove("CLAWSUITE_RUNTIME_DIR")
            .env_remove("CLAWOPS_CONFIG")
            .timeout(Duration::from_secs(60));
        cmd
    }

    pub fn runtime_file(&self, name: &str) -> PathBuf {
        self.runtime.join(name)
    }

    pub fn read_json(&self, relative: &str) -> serde_json::Value {
        let raw = fs::read_to_string(self.runtime.join(relative))
            .unwrap_or_else(|err| panic!("failed to read {relative}: {err}"));
        serde_json::from_str(&raw).expect("invalid json")
    }

    /// Replaces the build command in the project's config file.
    pub fn set_build(&self, build: &str) {
        self.rewrite_config("  build:", &format!("  build: \"{build}\""));
    }

    /// Points the contract health port somewhere else in the config file.
    pub fn set_health_port(&self, port: u16) {
        self.rewrite_config("health_port:", &format!("health_port: {port}"));
    }

    fn rewrite_config(&self, prefix: &str, replacement: &str) {
        let path = self.dir.join("clawops.yaml");
        let config = fs::read_to_string(&path).expect("failed to read config");
        let rewritten: Vec<String> = config
            .lines()
            .map(|line| {
                if line.starts_with(prefix) {
                    replacement.to_string()
                } else {
                    line.to_string()
                }
            })
            .collect();
        fs::write(&path, rewritten.join("\n") + "\n").expect("failed to write config");
    }

    /// Parsed journal entries, oldest first.
    pub fn journal(&self) -> Vec<serde_json::Value> {
        fs::read_to_string(self.runtime.join("deploy/journal.jsonl"))
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("invalid journal line"))
            .collect()
    }

    pub fn pid(&self) -> Option<u32> {
        fs::read_to_string(self.runtime.join("clawops.pid"))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Starts the health contract endpoint in the background.
    pub fn spawn_endpoint(&self) -> EndpointGuard {
        let child = StdCommand::new(assert_cmd::cargo::cargo_bin!("clawops"))
            .arg("--project-dir")
            .arg(&self.dir)
            .arg("--runtime-dir")
            .arg(&self.runtime)
            .args(["--log-level", "warn", "endpoint"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn endpoint");
        wait_for_port(self.health_port, true);
        EndpointGuard(child)
    }
}

/// Kills the background endpoint on drop.
pub struct EndpointGuard(Child);

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        let _ = Command::new(assert_cmd::cargo::cargo_bin!("clawops"))
            .arg("--project-dir")
            .arg(&self.dir)
            .arg("--runtime-dir")
            .arg(&self.runtime)
            .args(["stop", "--force"])
            .timeout(Duration::from_secs(20))
            .output();
    }
}

/// Port nothing can listen on without privileges; probes against it are
/// refused immediately.
pub const UNREACHABLE_PORT: u16 = 1;

/// Shell command that runs the contract endpoint as a stand-in server.
///
/// The endpoint answers 200 on `/` whatever its target reports, so it is
/// pointed at [`UNREACHABLE_PORT`] rather than at its own listen port.
pub fn server_command() -> String {
    let bin = assert_cmd::cargo::cargo_bin!("clawops");
    format!(
        "CLAWSUITE_PORT={UNREACHABLE_PORT} exec '{}' --log-level warn endpoint --listen-port $PORT",
        bin.display()
    )
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to allocate port")
}

pub fn port_open(port: u16) -> bool {
    TcpStream::connect_timeout(
        &format!("127.0.0.1:{port}").parse().unwrap(),
        Duration::from_millis(200),
    )
    .is_ok()
}

pub fn wait_for_port(port: u16, open: bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if port_open(port) == open {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for port {port} to become {}", if open { "open" } else { "closed" });
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}
