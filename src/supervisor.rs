//! Single-owner lifecycle for the dashboard server process.
//!
//! `start` walks `lock -> port reconcile -> [clean] -> [build] -> launch ->
//! wait for healthy -> commit`. Every exit path leaves a [`HealthState`]
//! snapshot describing what happened.
use std::{
    fs, io,
    path::Path,
    sync::Arc,
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ServerMode, Settings},
    error::{OpsError, Result},
    fsutil::{read_pid, remove_if_exists, write_atomic},
    health::{self, HealthEvaluator, HealthState, PortStatus},
    inspector::InspectorChain,
    lock::PidLock,
    process::{
        TerminatePolicy, Termination, is_alive, launch_detached, process_name, run_command,
        terminate,
    },
    retry::{RetryOutcome, retry_with_interval},
    runtime::RuntimeDirectory,
};

/// Parameters for [`ProcessSupervisor::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub host: String,
    pub port: u16,
    pub mode: ServerMode,
    /// Run the build step before launching a mode that serves a build.
    pub build: bool,
    /// Remove build output and bundler caches first.
    pub clean: bool,
    /// Terminate whatever occupies the port.
    pub force: bool,
}

impl StartOptions {
    /// Options targeting the configured host and port.
    pub fn from_settings(settings: &Settings, mode: ServerMode) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            mode,
            build: true,
            clean: false,
            force: false,
        }
    }
}

/// Parameters for [`ProcessSupervisor::stop`].
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub port: u16,
    /// Skip the graceful period.
    pub force: bool,
}

/// What `stop` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub terminated: Vec<(u32, Termination)>,
}

impl StopReport {
    pub fn was_running(&self) -> bool {
        self.terminated
            .iter()
            .any(|(_, outcome)| *outcome != Termination::NotRunning)
    }
}

/// Snapshot reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub pid: Option<u32>,
    pub alive: bool,
    pub process_name: Option<String>,
    pub health: Option<HealthState>,
    pub lock_owner: Option<u32>,
}

/// Starts, stops and inspects the dashboard server.
pub struct ProcessSupervisor {
    settings: Settings,
    runtime: RuntimeDirectory,
    inspector: Arc<InspectorChain>,
}

impl ProcessSupervisor {
    pub fn new(settings: Settings, runtime: RuntimeDirectory, inspector: Arc<InspectorChain>) -> Self {
        Self {
            settings,
            runtime,
            inspector,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runtime(&self) -> &RuntimeDirectory {
        &self.runtime
    }

    pub fn inspector(&self) -> &Arc<InspectorChain> {
        &self.inspector
    }

    /// Builds the evaluator used for local checks.
    pub fn evaluator(&self) -> Result<HealthEvaluator> {
        HealthEvaluator::new(Arc::clone(&self.inspector), self.settings.http_timeout)
    }

    fn terminate_policy(&self, immediate: bool) -> TerminatePolicy {
        TerminatePolicy {
            checks: self.settings.terminate_checks,
            interval: self.settings.terminate_interval,
            immediate,
        }
    }

    /// Mode recorded by the last snapshot, if the server is believed running.
    pub fn recorded_mode(&self) -> Option<ServerMode> {
        health::load_state(&self.runtime)
            .ok()
            .flatten()
            .map(|state| state.mode)
            .filter(|mode| *mode != ServerMode::Stopped)
    }

    /// Starts the server and blocks until it is healthy.
    pub fn start(&self, options: &StartOptions) -> Result<HealthState> {
        self.runtime.ensure()?;
        let _lock = PidLock::acquire(&self.runtime.lock_file())?;
        self.start_locked(options)
    }

    /// Stops whatever serves `options.port`, then starts with `force` semantics.
    pub fn restart(&self, options: &StartOptions) -> Result<HealthState> {
        self.runtime.ensure()?;
        let _lock = PidLock::acquire(&self.runtime.lock_file())?;

        self.stop(&StopOptions {
            port: options.port,
            force: false,
        })?;

        let options = StartOptions {
            force: true,
            ..options.clone()
        };
        self.start_locked(&options)
    }

    fn start_locked(&self, options: &StartOptions) -> Result<HealthState> {
        info!(
            "Starting dashboard server in {} mode on {}:{}",
            options.mode, options.host, options.port
        );
        let command = self.settings.commands.for_mode(options.mode)?.to_string();
        let evaluator = self.evaluator()?;

        if let Err(err) = self.reconcile_port(options) {
            self.record_failure(&evaluator, options, &err);
            return Err(err);
        }

        if options.clean
            && let Err(err) = self.clean()
        {
            self.record_failure(&evaluator, options, &err);
            return Err(err);
        }

        if options.mode.requires_build() && options.build {
            info!("Building artifacts for {} mode", options.mode);
            if let Err(err) = run_command(
                &self.settings.commands.build,
                &self.settings.project_dir,
                &self.launch_env(options),
                &self.runtime.server_log_file(),
                None,
            ) {
                error!("Build failed: {err}");
                self.record_failure(&evaluator, options, &err);
                return Err(err);
            }
        }

        let launched = match launch_detached(
            &command,
            &self.settings.project_dir,
            &self.launch_env(options),
            &self.runtime.server_log_file(),
        ) {
            Ok(pid) => pid,
            Err(err) => {
                self.record_failure(&evaluator, options, &err);
                return Err(err);
            }
        };

        match self.wait_for_healthy(&evaluator, options, launched) {
            Ok(state) => {
                let pid = state.pid.unwrap_or(launched);
                write_atomic(&self.runtime.pid_file(), format!("{pid}\n").as_bytes())?;
                health::persist_state(&self.runtime, &state)?;
                info!("Dashboard server healthy on port {} (PID {pid})", options.port);
                Ok(state)
            }
            Err((state, err)) => {
                error!("{err}; stopping launched process {launched}");
                self.abort_launch(launched, options.port);
                let state = state.with_error(err.to_string());
                health::persist_state(&self.runtime, &state)?;
                Err(err)
            }
        }
    }

    fn launch_env(&self, options: &StartOptions) -> Vec<(&'static str, String)> {
        vec![
            ("PORT", options.port.to_string()),
            ("HOST", options.host.clone()),
            ("CLAWSUITE_MODE", options.mode.to_string()),
        ]
    }

    /// Clears the port, terminating the occupant only under `force`.
    fn reconcile_port(&self, options: &StartOptions) -> Result<()> {
        let handle = self.inspector.find_process_on_port(options.port)?;
        if !handle.listening {
            return Ok(());
        }

        let occupant = handle.pid.or_else(|| {
            read_pid(&self.runtime.pid_file()).filter(|pid| is_alive(*pid))
        });

        if !options.force {
            warn!(
                "Port {} already in use by {:?}; pass --force to replace it",
                options.port, occupant
            );
            return Err(OpsError::PortInUse {
                port: options.port,
                pid: occupant,
            });
        }

        let Some(pid) = occupant else {
            return Err(OpsError::PortInUse {
                port: options.port,
                pid: None,
            });
        };

        info!("Terminating PID {pid} occupying port {}", options.port);
        terminate(pid, self.terminate_policy(false))?;

        let released = retry_with_interval(
            self.settings.terminate_interval,
            self.settings.terminate_checks,
            |_| {
                let handle = self.inspector.find_process_on_port(options.port).ok()?;
                (!handle.listening).then_some(())
            },
        );

        if !released.is_ready() {
            return Err(OpsError::PortInUse {
                port: options.port,
                pid: self
                    .inspector
                    .find_process_on_port(options.port)
                    .ok()
                    .and_then(|handle| handle.pid),
            });
        }

        Ok(())
    }

    /// Removes configured build output and caches.
    pub fn clean(&self) -> Result<()> {
        for relative in &self.settings.clean_paths {
            let path = self.settings.project_path(relative);
            remove_path(&path)?;
            debug!("Removed {}", path.display());
        }
        Ok(())
    }

    fn wait_for_healthy(
        &self,
        evaluator: &HealthEvaluator,
        options: &StartOptions,
        launched: u32,
    ) -> std::result::Result<HealthState, (HealthState, OpsError)> {
        let mut last = None;
        let outcome = retry_with_interval(
            self.settings.health_wait_interval,
            self.settings.health_wait_attempts,
            |attempt| {
                let state = evaluator.check_health(&options.host, options.port, options.mode);
                if state.healthy() {
                    return Some(Ok(state));
                }

                // The launched shell exited and nothing took the port.
                if state.port_status != PortStatus::Listening && !is_alive(launched) {
                    return Some(Err(state));
                }

                debug!("Health attempt {attempt}: {}", state.summary());
                last = Some(state);
                None
            },
        );

        match outcome {
            RetryOutcome::Ready { value: Ok(state), .. } => Ok(state),
            RetryOutcome::Ready {
                value: Err(state),
                attempt,
            } => Err((
                state,
                OpsError::HealthTimeout {
                    port: options.port,
                    attempts: attempt,
                },
            )),
            RetryOutcome::TimedOut { attempts } => {
                let state = last.unwrap_or_else(|| {
                    evaluator.check_health(&options.host, options.port, options.mode)
                });
                Err((
                    state,
                    OpsError::HealthTimeout {
                        port: options.port,
                        attempts,
                    },
                ))
            }
        }
    }

    fn abort_launch(&self, launched: u32, port: u16) {
        let occupant = self
            .inspector
            .find_process_on_port(port)
            .ok()
            .and_then(|handle| handle.pid);

        for pid in [Some(launched), occupant.filter(|pid| *pid != launched)]
            .into_iter()
            .flatten()
        {
            if let Err(err) = terminate(pid, self.terminate_policy(false)) {
                warn!("Failed to stop PID {pid}: {err}");
            }
        }
    }

    fn record_failure(&self, evaluator: &HealthEvaluator, options: &StartOptions, err: &OpsError) {
        let state = evaluator
            .check_health(&options.host, options.port, options.mode)
            .with_error(err.to_string());
        if let Err(write_err) = health::persist_state(&self.runtime, &state) {
            warn!("Failed to persist health state: {write_err}");
        }
    }

    /// Stops the server. Stopping a stopped server succeeds.
    pub fn stop(&self, options: &StopOptions) -> Result<StopReport> {
        self.runtime.ensure()?;
        let handle = self.inspector.find_process_on_port(options.port)?;
        let recorded = read_pid(&self.runtime.pid_file()).filter(|pid| is_alive(*pid));

        if handle.listening && handle.pid.is_none() && recorded.is_none() {
            let err = OpsError::PortInUse {
                port: options.port,
                pid: None,
            };
            let state = self
                .evaluator()?
                .check_health(&self.settings.host, options.port, ServerMode::Stopped)
                .with_error(err.to_string());
            health::persist_state(&self.runtime, &state)?;
            return Err(err);
        }

        let mut report = StopReport::default();
        let policy = self.terminate_policy(options.force);
        let targets = [handle.pid, recorded.filter(|pid| Some(*pid) != handle.pid)];

        for pid in targets.into_iter().flatten() {
            info!("Stopping PID {pid} on port {}", options.port);
            let outcome = terminate(pid, policy)?;
            report.terminated.push((pid, outcome));
        }

        if !report.was_running() {
            info!("Dashboard server on port {} already stopped", options.port);
        }

        remove_if_exists(&self.runtime.pid_file())?;
        health::persist_state(
            &self.runtime,
            &HealthState::stopped(&self.settings.host, options.port),
        )?;

        Ok(report)
    }

    /// Collects the persisted view of the server.
    pub fn status(&self) -> Result<SupervisorStatus> {
        let pid = read_pid(&self.runtime.pid_file());
        let alive = pid.is_some_and(is_alive);
        Ok(SupervisorStatus {
            pid,
            alive,
            process_name: pid.filter(|_| alive).and_then(process_name),
            health: health::load_state(&self.runtime)?,
            lock_owner: PidLock::owner(&self.runtime.lock_file()),
        })
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
