//! OS process primitives: liveness, termination, detached launch and external
//! command execution.
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, waitpid},
    },
    unistd::Pid,
};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG},
    error::{OpsError, Result},
    retry::retry_with_interval,
};

fn nix_error_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Reaps `pid` if it is an exited child of this process. No-op otherwise.
fn reap(pid: Pid) {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

/// Returns whether `pid` refers to a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    let target = Pid::from_raw(pid as i32);
    reap(target);

    match signal::kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state character follows the parenthesised command name.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Returns the executable name of `pid`, when visible.
pub fn process_name(pid: u32) -> Option<String> {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .map(|process| process.name().to_string_lossy().into_owned())
}

/// How a process should be terminated.
#[derive(Debug, Clone, Copy)]
pub struct TerminatePolicy {
    /// Liveness checks after SIGTERM before escalating.
    pub checks: usize,
    /// Interval between liveness checks.
    pub interval: Duration,
    /// Skip the grace period and send SIGKILL straight away.
    pub immediate: bool,
}

/// How a terminated process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone.
    NotRunning,
    /// The process exited after SIGTERM.
    Graceful,
    /// The process had to be killed.
    Killed,
}

/// Sends SIGTERM (to the process group when it is distinct from ours), polls
/// for exit, then escalates to SIGKILL.
pub fn terminate(pid: u32, policy: TerminatePolicy) -> Result<Termination> {
    if !is_alive(pid) {
        return Ok(Termination::NotRunning);
    }

    let target = Pid::from_raw(pid as i32);
    let first_signal = if policy.immediate {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };

    debug!("Sending {first_signal} to PID {pid}");
    send_signal(target, first_signal)?;

    if policy.immediate {
        wait_for_exit(pid, policy);
        return Ok(Termination::Killed);
    }

    if wait_for_exit(pid, policy) {
        return Ok(Termination::Graceful);
    }

    warn!("PID {pid} did not exit after SIGTERM; sending SIGKILL");
    send_signal(target, Signal::SIGKILL)?;

    if !wait_for_exit(pid, policy) {
        return Err(OpsError::StopFailed {
            pid,
            source: io::Error::new(io::ErrorKind::TimedOut, "process survived SIGKILL"),
        });
    }

    Ok(Termination::Killed)
}

fn wait_for_exit(pid: u32, policy: TerminatePolicy) -> bool {
    retry_with_interval(policy.interval, policy.checks, |_| {
        (!is_alive(pid)).then_some(())
    })
    .is_ready()
}

fn send_signal(target: Pid, sig: Signal) -> Result<()> {
    let own_pgid = unsafe { libc::getpgid(0) };
    let child_pgid = unsafe { libc::getpgid(target.as_raw()) };

    if child_pgid >= 0 && child_pgid != own_pgid {
        let kill_result = unsafe { libc::killpg(child_pgid, sig as libc::c_int) };
        if kill_result < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {}
                Some(code) if code == libc::EPERM => {
                    warn!(
                        "Insufficient permissions to signal process group {child_pgid}; falling back to direct signal"
                    );
                }
                _ => {
                    return Err(OpsError::StopFailed {
                        pid: target.as_raw() as u32,
                        source: err,
                    });
                }
            }
        }
    }

    match signal::kill(target, Some(sig)) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(OpsError::StopFailed {
            pid: target.as_raw() as u32,
            source: nix_error_to_io(err),
        }),
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn shell(command: &str, working_dir: &Path, env: &[(&str, String)]) -> Command {
    let mut cmd = Command::new(DEFAULT_SHELL);
    cmd.arg(SHELL_COMMAND_FLAG).arg(command);
    cmd.current_dir(working_dir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd
}

/// Launches `command` in a new session so it outlives the caller. Output is
/// appended to `log_path`. Returns the PID of the launched shell.
pub fn launch_detached(
    command: &str,
    working_dir: &Path,
    env: &[(&str, String)],
    log_path: &Path,
) -> Result<u32> {
    let launch_error = |source: io::Error| OpsError::LaunchFailed {
        command: command.to_string(),
        source,
    };

    let stdout = open_log(log_path).map_err(launch_error)?;
    let stderr = stdout.try_clone().map_err(launch_error)?;

    let mut cmd = shell(command, working_dir, env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                let err = io::Error::last_os_error();
                eprintln!("clawops pre_exec: setsid failed: {:?}", err);
                return Err(err);
            }
            Ok(())
        });
    }

    debug!("Executing command: {cmd:?}");
    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id();
            info!("Launched `{command}` with PID {pid}");
            Ok(pid)
        }
        Err(e) => {
            error!("Failed to launch `{command}`: {e}");
            Err(launch_error(e))
        }
    }
}

/// Runs `command` to completion, appending its output to `log_path`.
/// A non-zero exit or timeout is reported as [`OpsError::CommandFailed`].
pub fn run_command(
    command: &str,
    working_dir: &Path,
    env: &[(&str, String)],
    log_path: &Path,
    timeout: Option<Duration>,
) -> Result<()> {
    let stdout = open_log(log_path)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = shell(command, working_dir, env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    info!("Running `{command}` in {}", working_dir.display());
    let mut child = cmd.spawn().map_err(|source| OpsError::LaunchFailed {
        command: command.to_string(),
        source,
    })?;

    let status = match timeout {
        Some(duration) => wait_with_timeout(&mut child, duration)?,
        None => Some(child.wait()?),
    };

    match status {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(OpsError::CommandFailed {
            command: command.to_string(),
            code: status.code(),
        }),
        None => {
            warn!("`{command}` timed out; terminating");
            let _ = child.kill();
            let _ = child.wait();
            Err(OpsError::CommandFailed {
                command: command.to_string(),
                code: None,
            })
        }
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
