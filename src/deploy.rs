//! Transactional deployments with automatic rollback.
//!
//! Every phase of a deploy is appended to the journal under a fresh
//! transaction id. A pre-deploy backup is taken first; when a later phase
//! fails, that backup (the state left by the last successful deploy) is
//! restored and the server restarted.
use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{error, info, warn};

use crate::{
    backup::BackupStore,
    config::ServerMode,
    constants::{BACKUP_RETENTION, CONTRACT_HTTP_TIMEOUT},
    error::{OpsError, Result},
    fsutil::remove_if_exists,
    health::{HealthEvaluator, HealthState},
    journal::{
        CurrentState, DeployStatus, Journal, Transaction, TxAction, TxStatus, new_transaction_id,
    },
    lock::PidLock,
    process::run_command,
    retry::{RetryOutcome, attempts_for, retry_with_interval},
    supervisor::{ProcessSupervisor, StartOptions, StopOptions},
};

/// Number of journal entries shown by `status`.
const STATUS_JOURNAL_ENTRIES: usize = 5;

/// Which server the post-deploy health check probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum HealthTarget {
    /// The health contract endpoint's `/ready` route.
    #[default]
    Contract,
    /// The application port's root path.
    App,
}

/// Parameters for [`Deployer::deploy`].
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub mode: ServerMode,
    /// Run the build command before restarting.
    pub pre_build: bool,
    pub health_check: bool,
    pub health_target: HealthTarget,
    /// Budget for the post-deploy health check.
    pub timeout: Duration,
}

/// Parameters for [`Deployer::rollback`].
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Transaction whose pre-deploy backup is restored; defaults to the last
    /// successful deploy.
    pub target: Option<String>,
    /// Skip post-rollback health verification.
    pub force: bool,
    /// Mode to restart in; defaults to the recorded mode.
    pub mode: Option<ServerMode>,
}

/// Summary of a successful deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub tx_id: String,
    pub version: String,
    pub pruned: Vec<String>,
}

/// Read-only overview for `deploy status`.
#[derive(Debug, Clone, Serialize)]
pub struct DeployOverview {
    pub current: Option<CurrentState>,
    pub recent: Vec<Transaction>,
    pub backups: Vec<String>,
}

/// A single `verify` check.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Aggregated `verify` result. Passing means zero issues.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub checks: Vec<VerifyCheck>,
    pub issues: usize,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.issues == 0
    }
}

fn is_successful_deploy(entry: &Transaction) -> bool {
    entry.is_success() && entry.action == TxAction::DeployComplete
}

/// Drives deploys and rollbacks for one runtime directory.
pub struct Deployer<'a> {
    supervisor: &'a ProcessSupervisor,
    store: BackupStore,
}

impl<'a> Deployer<'a> {
    pub fn new(supervisor: &'a ProcessSupervisor) -> Self {
        let store = BackupStore::new(supervisor.runtime().backups_dir());
        Self { supervisor, store }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.store
    }

    fn lock(&self) -> Result<PidLock> {
        let runtime = self.supervisor.runtime();
        runtime.ensure()?;
        PidLock::acquire(&runtime.deploy_lock_file())
    }

    fn journal(&self) -> Result<Journal> {
        Journal::open(&self.supervisor.runtime().journal_file())
    }

    fn save_current(&self, state: &CurrentState) -> Result<()> {
        state.save(&self.supervisor.runtime().current_state_file())
    }

    /// Puts back the pointer that was current before an aborted deploy.
    fn restore_current(&self, prior: Option<&CurrentState>) -> Result<()> {
        match prior {
            Some(state) => self.save_current(state),
            None => {
                remove_if_exists(&self.supervisor.runtime().current_state_file())?;
                Ok(())
            }
        }
    }

    /// Creates the deploy tree, an empty journal and an `initialized`
    /// pointer. Existing state is left untouched.
    pub fn init(&self) -> Result<CurrentState> {
        let _lock = self.lock()?;
        let runtime = self.supervisor.runtime();

        std::fs::create_dir_all(runtime.backups_dir())?;
        Journal::touch(&runtime.journal_file())?;

        if let Some(current) = CurrentState::load(&runtime.current_state_file())? {
            info!("Deployment state already initialised ({})", current.status);
            return Ok(current);
        }

        let current = CurrentState::new(
            DeployStatus::Initialized,
            None,
            &self.supervisor.settings().app_version(),
        );
        self.save_current(&current)?;
        info!("Initialised deployment state in {}", runtime.deploy_dir().display());
        Ok(current)
    }

    /// Runs a full deploy, rolling back automatically on phase failure.
    pub fn deploy(&self, options: &DeployOptions) -> Result<DeployReport> {
        let _lock = self.lock()?;
        let settings = self.supervisor.settings();
        let runtime = self.supervisor.runtime();

        let mut journal = self.journal()?;
        let prior = CurrentState::load(&runtime.current_state_file())?;
        let tx_id = new_transaction_id();
        let version = settings.app_version();

        info!("Deploying version {version} as {tx_id}");
        journal.record(
            &tx_id,
            TxAction::DeployStart,
            TxStatus::Started,
            json!({
                "version": version,
                "mode": options.mode,
                "pre_build": options.pre_build,
                "health_check": options.health_check,
            }),
        )?;
        self.save_current(&CurrentState::new(
            DeployStatus::Deploying,
            Some(&tx_id),
            &version,
        ))?;

        match self
            .store
            .create(&tx_id, &settings.project_dir, &settings.backup_paths, runtime)
        {
            Ok(metadata) => {
                journal.record(
                    &tx_id,
                    TxAction::BackupCreated,
                    TxStatus::Success,
                    json!({ "files": metadata.files.len() }),
                )?;
            }
            Err(err) => {
                journal.record(
                    &tx_id,
                    TxAction::BackupCreated,
                    TxStatus::Failed,
                    json!({ "error": err.to_string() }),
                )?;
                self.restore_current(prior.as_ref())?;
                return Err(OpsError::Deployment {
                    phase: "backup".to_string(),
                    reason: err.to_string(),
                });
            }
        }

        if options.pre_build {
            journal.record(&tx_id, TxAction::BuildStart, TxStatus::Started, json!({}))?;
            let build = run_command(
                &settings.commands.build,
                &settings.project_dir,
                &[("CLAWSUITE_MODE", options.mode.to_string())],
                &runtime.server_log_file(),
                None,
            );
            if let Err(err) = build {
                journal.record(
                    &tx_id,
                    TxAction::BuildComplete,
                    TxStatus::Failed,
                    json!({ "error": err.to_string() }),
                )?;
                return Err(self.abort(&mut journal, &tx_id, prior.as_ref(), options, "build", err));
            }
            journal.record(&tx_id, TxAction::BuildComplete, TxStatus::Success, json!({}))?;
        }

        let started = self.restart_server(options.mode, !options.pre_build);
        match started {
            Ok(state) => {
                journal.record(
                    &tx_id,
                    TxAction::ServerStart,
                    TxStatus::Success,
                    json!({ "pid": state.pid, "port": state.port }),
                )?;
            }
            Err(err) => {
                journal.record(
                    &tx_id,
                    TxAction::ServerStart,
                    TxStatus::Failed,
                    json!({ "error": err.to_string() }),
                )?;
                return Err(self.abort(
                    &mut journal,
                    &tx_id,
                    prior.as_ref(),
                    options,
                    "server_start",
                    err,
                ));
            }
        }

        if options.health_check {
            let (port, outcome) = match self.post_deploy_health(options) {
                Ok(checked) => checked,
                Err(err) => {
                    journal.record(
                        &tx_id,
                        TxAction::HealthCheck,
                        TxStatus::Failed,
                        json!({
                            "target": options.health_target.as_ref(),
                            "error": err.to_string(),
                        }),
                    )?;
                    return Err(self.abort(
                        &mut journal,
                        &tx_id,
                        prior.as_ref(),
                        options,
                        "health_check",
                        err,
                    ));
                }
            };
            let details = json!({
                "target": options.health_target.as_ref(),
                "port": port,
            });
            match outcome {
                Ok(attempts) => {
                    let mut details = details;
                    details["attempts"] = json!(attempts);
                    journal.record(&tx_id, TxAction::HealthCheck, TxStatus::Success, details)?;
                }
                Err(state) => {
                    let mut details = details;
                    details["error"] = json!(state.error);
                    journal.record(&tx_id, TxAction::HealthCheck, TxStatus::Failed, details)?;
                    let err = OpsError::HealthTimeout {
                        port,
                        attempts: attempts_for(options.timeout, settings.health_wait_interval),
                    };
                    return Err(self.abort(
                        &mut journal,
                        &tx_id,
                        prior.as_ref(),
                        options,
                        "health_check",
                        err,
                    ));
                }
            }
        } else {
            info!("Skipping post-deploy health check");
        }

        journal.record(
            &tx_id,
            TxAction::DeployComplete,
            TxStatus::Success,
            json!({ "version": version }),
        )?;
        self.save_current(&CurrentState::new(
            DeployStatus::Deployed,
            Some(&tx_id),
            &version,
        ))?;

        let pruned = self.store.prune(BACKUP_RETENTION)?;
        info!("Deployment {tx_id} complete");
        Ok(DeployReport {
            tx_id,
            version,
            pruned,
        })
    }

    fn restart_server(&self, mode: ServerMode, build: bool) -> Result<HealthState> {
        let settings = self.supervisor.settings();
        self.supervisor.stop(&StopOptions {
            port: settings.port,
            force: false,
        })?;
        let options = StartOptions {
            build,
            force: true,
            ..StartOptions::from_settings(settings, mode)
        };
        self.supervisor.start(&options)
    }

    /// Polls the configured health target. `Ok(attempt)` on success, the last
    /// observed state on timeout.
    fn post_deploy_health(
        &self,
        options: &DeployOptions,
    ) -> Result<(u16, std::result::Result<usize, HealthState>)> {
        let settings = self.supervisor.settings();
        let inspector = Arc::clone(self.supervisor.inspector());
        let (port, evaluator) = match options.health_target {
            HealthTarget::Contract if settings.health_port == settings.port => {
                return Err(OpsError::config(format!(
                    "health port {} is the application port; the contract endpoint cannot share it",
                    settings.port
                )));
            }
            HealthTarget::Contract => (
                settings.health_port,
                HealthEvaluator::new(inspector, CONTRACT_HTTP_TIMEOUT)?.with_path("/ready"),
            ),
            HealthTarget::App => (
                settings.port,
                HealthEvaluator::new(inspector, settings.http_timeout)?,
            ),
        };

        info!("Verifying health via {} on port {port}", options.health_target);
        let interval = settings.health_wait_interval;
        let mut last = None;
        let outcome = retry_with_interval(interval, attempts_for(options.timeout, interval), |_| {
            let state = evaluator.check_health(&settings.host, port, options.mode);
            if state.healthy() {
                return Some(());
            }
            last = Some(state);
            None
        });

        Ok(match outcome {
            RetryOutcome::Ready { attempt, .. } => (port, Ok(attempt)),
            RetryOutcome::TimedOut { .. } => (
                port,
                Err(last.unwrap_or_else(|| {
                    evaluator.check_health(&settings.host, port, options.mode)
                })),
            ),
        })
    }

    /// Handles a failed phase: rolls back, then reports the phase failure.
    fn abort(
        &self,
        journal: &mut Journal,
        tx_id: &str,
        prior: Option<&CurrentState>,
        options: &DeployOptions,
        phase: &str,
        cause: OpsError,
    ) -> OpsError {
        error!("Deployment {tx_id} failed during {phase}: {cause}");
        let reason = format!("{phase}_failed");

        match self.rollback_internal(journal, tx_id, prior, options.mode, &reason) {
            Ok(restored) => {
                warn!("Rolled back to {restored} after failed {phase}");
                OpsError::Deployment {
                    phase: phase.to_string(),
                    reason: cause.to_string(),
                }
            }
            Err(rollback_err) => OpsError::RollbackFailed(format!(
                "{phase} failed ({cause}) and rollback failed: {rollback_err}"
            )),
        }
    }

    /// Restores the pre-deploy backup of `failed_tx` and restarts. The
    /// current-state pointer then references the last successful deploy.
    fn rollback_internal(
        &self,
        journal: &mut Journal,
        failed_tx: &str,
        prior: Option<&CurrentState>,
        mode: ServerMode,
        reason: &str,
    ) -> Result<String> {
        let settings = self.supervisor.settings();

        let Some(target) = journal
            .last_matching(|entry| is_successful_deploy(entry) && entry.tx_id != failed_tx)
            .map(|entry| entry.tx_id.clone())
        else {
            journal.record(
                failed_tx,
                TxAction::Rollback,
                TxStatus::Failed,
                json!({ "reason": "no_prior_success", "trigger": reason }),
            )?;
            self.restore_current(prior)?;
            return Err(OpsError::RollbackFailed(
                "no prior successful deployment to roll back to".to_string(),
            ));
        };

        info!("Rolling back {failed_tx} to the state of {target}");
        let restored = self
            .supervisor
            .stop(&StopOptions {
                port: settings.port,
                force: false,
            })
            .and_then(|_| self.store.restore(failed_tx, &settings.project_dir))
            .and_then(|_| {
                let options = StartOptions {
                    build: false,
                    force: true,
                    ..StartOptions::from_settings(settings, mode)
                };
                self.supervisor.start(&options)
            });

        match restored {
            Ok(_) => {
                journal.record(
                    failed_tx,
                    TxAction::Rollback,
                    TxStatus::Success,
                    json!({ "reason": reason, "restored_to": target, "backup": failed_tx }),
                )?;
                let version = settings.app_version();
                self.save_current(&CurrentState::new(
                    DeployStatus::RolledBack,
                    Some(&target),
                    &version,
                ))?;
                Ok(target)
            }
            Err(err) => {
                journal.record(
                    failed_tx,
                    TxAction::Rollback,
                    TxStatus::Failed,
                    json!({
                        "reason": reason,
                        "restored_to": target,
                        "backup": failed_tx,
                        "error": err.to_string(),
                    }),
                )?;
                self.restore_current(prior)?;
                Err(err)
            }
        }
    }

    /// Restores the pre-deploy backup of a transaction (default: the last
    /// successful deploy), restarts and, unless forced, verifies health.
    pub fn rollback(&self, options: &RollbackOptions) -> Result<String> {
        let _lock = self.lock()?;
        let settings = self.supervisor.settings();
        let mut journal = self.journal()?;

        let target = match &options.target {
            Some(target) => target.clone(),
            None => journal
                .last_matching(is_successful_deploy)
                .map(|entry| entry.tx_id.clone())
                .ok_or_else(|| {
                    OpsError::RollbackFailed("no successful transaction to roll back".to_string())
                })?,
        };

        if !self.store.exists(&target) {
            return Err(OpsError::NoBackup(target));
        }

        let mode = options
            .mode
            .or_else(|| self.supervisor.recorded_mode())
            .unwrap_or(ServerMode::Preview);
        let tx_id = new_transaction_id();
        journal.record(
            &tx_id,
            TxAction::ManualRollback,
            TxStatus::Started,
            json!({ "target": target, "force": options.force }),
        )?;

        let result = self.manual_restore(&target, mode, options.force);
        match result {
            Ok(state) => {
                journal.record(
                    &tx_id,
                    TxAction::ManualRollback,
                    TxStatus::Success,
                    json!({ "target": target, "healthy": state.healthy() }),
                )?;
                self.save_current(&CurrentState::new(
                    DeployStatus::RolledBack,
                    Some(&target),
                    &settings.app_version(),
                ))?;
                info!("Manual rollback to {target} complete");
                Ok(target)
            }
            Err(err) => {
                journal.record(
                    &tx_id,
                    TxAction::ManualRollback,
                    TxStatus::Failed,
                    json!({ "target": target, "error": err.to_string() }),
                )?;
                Err(err)
            }
        }
    }

    fn manual_restore(&self, target: &str, mode: ServerMode, force: bool) -> Result<HealthState> {
        let settings = self.supervisor.settings();
        let runtime = self.supervisor.runtime();

        self.supervisor.stop(&StopOptions {
            port: settings.port,
            force: false,
        })?;
        self.store.restore(target, &settings.project_dir)?;

        let options = StartOptions {
            build: false,
            force: true,
            ..StartOptions::from_settings(settings, mode)
        };
        let started = self.supervisor.start(&options);

        if force {
            return match started {
                Ok(state) => Ok(state),
                Err(err) => {
                    warn!("Server did not become healthy after forced rollback: {err}");
                    Ok(self
                        .supervisor
                        .evaluator()?
                        .check_and_persist(runtime, &settings.host, settings.port, mode)?)
                }
            };
        }

        started?;
        let state = self
            .supervisor
            .evaluator()?
            .check_and_persist(runtime, &settings.host, settings.port, mode)?;
        if !state.healthy() {
            return Err(OpsError::RollbackFailed(format!(
                "restored {target} but the server is unhealthy: {}",
                state.summary()
            )));
        }
        Ok(state)
    }

    /// Current pointer, recent journal entries and available backups.
    pub fn status(&self) -> Result<DeployOverview> {
        let runtime = self.supervisor.runtime();
        let journal = self.journal()?;
        Ok(DeployOverview {
            current: CurrentState::load(&runtime.current_state_file())?,
            recent: journal.tail(STATUS_JOURNAL_ENTRIES).to_vec(),
            backups: self.store.list()?,
        })
    }

    /// The last `n` raw journal entries.
    pub fn journal_tail(&self, n: usize) -> Result<Vec<Transaction>> {
        Ok(self.journal()?.tail(n).to_vec())
    }

    /// Re-derives contract health and checks the deploy files exist.
    pub fn verify(&self) -> Result<VerifyReport> {
        let settings = self.supervisor.settings();
        let runtime = self.supervisor.runtime();
        let inspector = Arc::clone(self.supervisor.inspector());
        let mut checks = Vec::new();

        for (name, path) in [("contract_liveness", "/live"), ("contract_readiness", "/ready")] {
            let state = HealthEvaluator::new(Arc::clone(&inspector), CONTRACT_HTTP_TIMEOUT)?
                .with_path(path)
                .check_health(&settings.host, settings.health_port, ServerMode::Stopped);
            checks.push(VerifyCheck {
                name,
                passed: state.healthy(),
                detail: match state.error {
                    Some(error) => error,
                    None => format!("GET {path} on port {} ok", settings.health_port),
                },
            });
        }

        for (name, path) in [
            ("journal", runtime.journal_file()),
            ("current_state", runtime.current_state_file()),
            ("backups", runtime.backups_dir()),
        ] {
            let passed = path.exists();
            checks.push(VerifyCheck {
                name,
                passed,
                detail: format!(
                    "{} {}",
                    path.display(),
                    if passed { "present" } else { "missing" }
                ),
            });
        }

        let issues = checks.iter().filter(|check| !check.passed).count();
        if issues > 0 {
            warn!("Verification found {issues} issue(s)");
        }
        Ok(VerifyReport { checks, issues })
    }
}

/// Renders a journal entry as a single log-style line.
pub fn describe(entry: &Transaction) -> String {
    let details = match &entry.details {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => format!(" {other}"),
    };
    format!(
        "{} {} {} {}{details}",
        entry.timestamp.to_rfc3339(),
        entry.tx_id,
        entry.action,
        entry.status
    )
}
