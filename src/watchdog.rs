//! Periodic health supervision with failure accumulation.
//!
//! Each cycle evaluates the target, feeds the verdict through
//! [`WatchdogState::observe`] and acts on the resulting [`WatchdogAction`]. The
//! state is persisted after every cycle so that scheduler-driven single-shot
//! runs accumulate failures the same way the long-running loop does.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerMode,
    constants::{WATCHDOG_DECAY_WINDOW, WATCHDOG_FAILURE_THRESHOLD, WATCHDOG_TICK},
    error::{OpsError, Result},
    fsutil::{read_json, read_pid, remove_if_exists, write_json_atomic},
    health::{self, HealthState},
    lock::PidLock,
    process::{TerminatePolicy, Termination, is_alive, terminate},
    runtime::RuntimeDirectory,
    supervisor::{ProcessSupervisor, StartOptions},
};

/// Failure accounting thresholds.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogPolicy {
    /// Consecutive failures that trigger a restart.
    pub threshold: u32,
    /// Failures further apart than this are unrelated incidents.
    pub decay: Duration,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            threshold: WATCHDOG_FAILURE_THRESHOLD,
            decay: WATCHDOG_DECAY_WINDOW,
        }
    }
}

/// What a cycle decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WatchdogAction {
    /// Healthy, nothing to do.
    None,
    /// Healthy again after one or more failures.
    Recovered,
    /// Unhealthy, below the threshold.
    Wait,
    /// Unhealthy at or above the threshold.
    Restart,
}

/// Failure counters carried across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogState {
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_action: Option<WatchdogAction>,
}

impl WatchdogState {
    /// Applies one health verdict observed at `now`.
    pub fn observe(
        &mut self,
        healthy: bool,
        now: DateTime<Utc>,
        policy: &WatchdogPolicy,
    ) -> WatchdogAction {
        self.last_check = Some(now);

        let action = if healthy {
            let previous = std::mem::take(&mut self.consecutive_failures);
            if previous > 0 {
                WatchdogAction::Recovered
            } else {
                WatchdogAction::None
            }
        } else {
            if let Some(last) = self.last_failure {
                let decay = chrono::Duration::seconds(policy.decay.as_secs() as i64);
                if now.signed_duration_since(last) > decay {
                    self.consecutive_failures = 0;
                }
            }
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(now);

            if self.consecutive_failures >= policy.threshold {
                WatchdogAction::Restart
            } else {
                WatchdogAction::Wait
            }
        };

        self.last_action = Some(action);
        action
    }

    /// A restart brought the target back.
    pub fn restart_succeeded(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn load(runtime: &RuntimeDirectory) -> Result<Self> {
        Ok(read_json(&runtime.watchdog_state_file())?.unwrap_or_default())
    }

    pub fn save(&self, runtime: &RuntimeDirectory) -> Result<()> {
        write_json_atomic(&runtime.watchdog_state_file(), self)
    }
}

/// The supervised target.
pub trait WatchdogTarget {
    /// Evaluates health, persisting the snapshot when `persist` is set.
    fn check(&self, persist: bool) -> Result<HealthState>;

    /// Restarts the target.
    fn restart(&self) -> Result<HealthState>;
}

/// The dashboard server managed through a [`ProcessSupervisor`].
pub struct SupervisedServer<'a> {
    supervisor: &'a ProcessSupervisor,
    mode: ServerMode,
}

impl<'a> SupervisedServer<'a> {
    pub fn new(supervisor: &'a ProcessSupervisor, mode: ServerMode) -> Self {
        Self { supervisor, mode }
    }
}

impl WatchdogTarget for SupervisedServer<'_> {
    fn check(&self, persist: bool) -> Result<HealthState> {
        let settings = self.supervisor.settings();
        let evaluator = self.supervisor.evaluator()?;
        if persist {
            evaluator.check_and_persist(
                self.supervisor.runtime(),
                &settings.host,
                settings.port,
                self.mode,
            )
        } else {
            Ok(evaluator.check_health(&settings.host, settings.port, self.mode))
        }
    }

    fn restart(&self) -> Result<HealthState> {
        let options = StartOptions::from_settings(self.supervisor.settings(), self.mode);
        self.supervisor.restart(&options)
    }
}

/// Watchdog tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogOptions {
    pub interval: Duration,
    pub policy: WatchdogPolicy,
    /// Report the decision without restarting or persisting anything.
    pub dry_run: bool,
}

/// Outcome of a single cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub health: HealthState,
    pub action: WatchdogAction,
    pub consecutive_failures: u32,
    /// `Some(true)` when a restart succeeded, `Some(false)` when it failed.
    pub restarted: Option<bool>,
    pub dry_run: bool,
}

/// Drives cycles against a target.
pub struct Watchdog<'a> {
    runtime: &'a RuntimeDirectory,
    options: WatchdogOptions,
}

impl<'a> Watchdog<'a> {
    pub fn new(runtime: &'a RuntimeDirectory, options: WatchdogOptions) -> Self {
        Self { runtime, options }
    }

    /// Runs one check and acts on it.
    pub fn run_once(&self, target: &dyn WatchdogTarget) -> Result<CycleReport> {
        let mut state = WatchdogState::load(self.runtime)?;
        let dry_run = self.options.dry_run;

        let health = target.check(!dry_run)?;
        let action = state.observe(health.healthy(), Utc::now(), &self.options.policy);
        let failures = state.consecutive_failures;
        let threshold = self.options.policy.threshold;
        let mut restarted = None;

        match action {
            WatchdogAction::None => debug!("Target healthy: {}", health.summary()),
            WatchdogAction::Recovered => info!("Target recovered: {}", health.summary()),
            WatchdogAction::Wait if dry_run => warn!(
                "[dry-run] Target unhealthy ({failures}/{threshold}); would restart the server after {} more failure(s)",
                threshold - failures
            ),
            WatchdogAction::Wait => warn!(
                "Target unhealthy ({failures}/{threshold}): {}",
                health.summary()
            ),
            WatchdogAction::Restart if dry_run => warn!(
                "[dry-run] Target unhealthy ({failures}/{threshold}); would restart the server now"
            ),
            WatchdogAction::Restart => {
                warn!("Target unhealthy ({failures}/{threshold}); restarting the server");
                match target.restart() {
                    Ok(state_after) => {
                        info!("Restart succeeded: {}", state_after.summary());
                        state.restart_succeeded();
                        restarted = Some(true);
                    }
                    Err(err) => {
                        error!("Restart failed, will retry next cycle: {err}");
                        restarted = Some(false);
                    }
                }
            }
        }

        if dry_run {
            info!("[dry-run] Action: {action}");
        } else {
            state.save(self.runtime)?;
        }

        Ok(CycleReport {
            health,
            action,
            consecutive_failures: state.consecutive_failures,
            restarted,
            dry_run,
        })
    }

    /// Loops until `shutdown` is set. Holds the watchdog PID lock throughout.
    pub fn run_loop(&self, target: &dyn WatchdogTarget, shutdown: Arc<AtomicBool>) -> Result<()> {
        let lock = PidLock::acquire(&self.runtime.watchdog_pid_file())?;
        info!(
            "Watchdog running (PID {}, interval {:?}, threshold {})",
            lock.pid(),
            self.options.interval,
            self.options.policy.threshold
        );

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once(target) {
                Ok(_) => {}
                Err(err @ OpsError::ToolingUnavailable(_)) => return Err(err),
                Err(err) => error!("Watchdog cycle failed: {err}"),
            }
            sleep_unless_shutdown(self.options.interval, &shutdown);
        }

        info!("Watchdog shutting down");
        lock.release();
        Ok(())
    }
}

fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(WATCHDOG_TICK));
    }
}

/// Fails with [`OpsError::LockContention`] when a watchdog is already running.
pub fn ensure_not_running(runtime: &RuntimeDirectory) -> Result<()> {
    let path = runtime.watchdog_pid_file();
    match PidLock::owner(&path) {
        Some(pid) => Err(OpsError::LockContention { path, pid }),
        None => Ok(()),
    }
}

/// Terminates a running watchdog. `Ok(None)` when none was running.
pub fn stop(runtime: &RuntimeDirectory, policy: TerminatePolicy) -> Result<Option<Termination>> {
    let path = runtime.watchdog_pid_file();
    let Some(pid) = read_pid(&path).filter(|pid| is_alive(*pid)) else {
        info!("Watchdog is not running");
        remove_if_exists(&path)?;
        return Ok(None);
    };

    info!("Stopping watchdog PID {pid}");
    let outcome = terminate(pid, policy)?;
    remove_if_exists(&path)?;
    Ok(Some(outcome))
}

/// Persisted view of the watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub pid: Option<u32>,
    pub running: bool,
    pub state: WatchdogState,
    pub health: Option<HealthState>,
}

pub fn status(runtime: &RuntimeDirectory) -> Result<WatchdogStatus> {
    let pid = read_pid(&runtime.watchdog_pid_file());
    Ok(WatchdogStatus {
        pid,
        running: pid.is_some_and(is_alive),
        state: WatchdogState::load(runtime)?,
        health: health::load_state(runtime)?,
    })
}
