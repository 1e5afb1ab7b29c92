//! Rollback over source-control history.
//!
//! A [`RollbackPlan`] is fully resolved before anything is touched; dry runs
//! render it, real runs execute it. Every outcome is written to the
//! rollback-state file.
use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerMode,
    error::{OpsError, Result},
    fsutil::{read_json, write_json_atomic},
    health::HealthState,
    process::run_command,
    runtime::RuntimeDirectory,
    supervisor::{ProcessSupervisor, StartOptions, StopOptions},
};

/// Thin wrapper around the `git` executable.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => OpsError::ToolingUnavailable("git".to_string()),
                _ => OpsError::Io(err),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(OpsError::Git(format!("`git {}` failed: {stderr}", args.join(" "))));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn head(&self) -> Result<String> {
        self.run(&["rev-parse", "--verify", "HEAD"])
    }

    /// Resolves `reference` to a full commit hash.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let revspec = format!("{reference}^{{commit}}");
        self.run(&["rev-parse", "--verify", "--quiet", &revspec])
            .map_err(|err| match err {
                OpsError::Git(_) => OpsError::config(format!("unknown git reference '{reference}'")),
                other => other,
            })
    }

    /// The `steps`-th ancestor of HEAD along first parents.
    pub fn first_parent_ancestor(&self, steps: u32) -> Result<String> {
        self.resolve(&format!("HEAD~{steps}"))
    }

    /// Whether tracked files have uncommitted modifications.
    pub fn is_dirty(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.is_empty())
    }

    pub fn checkout_detached(&self, commit: &str) -> Result<()> {
        self.run(&["checkout", "--force", "--detach", commit])?;
        Ok(())
    }
}

/// Where to roll back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Any reference git can resolve to a commit.
    Ref(String),
    /// Ancestor along the first-parent chain.
    Steps(u32),
}

/// A resolved rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackPlan {
    pub from: String,
    pub to: String,
    pub mode: ServerMode,
    pub port: u16,
}

impl RollbackPlan {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for RollbackPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (mode: {}, port: {})",
            short(&self.from),
            short(&self.to),
            self.mode,
            self.port
        )
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

/// Terminal status of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RollbackStatus {
    Success,
    Failed,
    Noop,
}

/// Contents of the rollback-state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackState {
    pub timestamp: DateTime<Utc>,
    pub status: RollbackStatus,
    pub from: String,
    pub to: String,
    pub mode: ServerMode,
    pub port: u16,
    pub health: Option<HealthState>,
    pub error: Option<String>,
}

impl RollbackState {
    fn from_plan(
        plan: &RollbackPlan,
        status: RollbackStatus,
        health: Option<HealthState>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            from: plan.from.clone(),
            to: plan.to.clone(),
            mode: plan.mode,
            port: plan.port,
            health,
            error,
        }
    }

    pub fn load(runtime: &RuntimeDirectory) -> Result<Option<Self>> {
        read_json(&runtime.rollback_state_file())
    }

    fn save(&self, runtime: &RuntimeDirectory) -> Result<()> {
        write_json_atomic(&runtime.rollback_state_file(), self)
    }
}

/// What a rollback invocation did.
#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    /// Dry run: the plan and whether the tree was dirty.
    Planned { plan: RollbackPlan, dirty: bool },
    /// Executed (or no-op) with the recorded state.
    Completed(RollbackState),
}

/// Git-driven rollback of the dashboard checkout.
pub struct GitRollback<'a> {
    supervisor: &'a ProcessSupervisor,
    git: Git,
}

impl<'a> GitRollback<'a> {
    pub fn new(supervisor: &'a ProcessSupervisor) -> Self {
        let git = Git::new(&supervisor.settings().project_dir);
        Self { supervisor, git }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Resolves `target` without side effects.
    pub fn plan(&self, target: &RollbackTarget, mode: ServerMode, port: u16) -> Result<RollbackPlan> {
        let from = self.git.head()?;
        let to = match target {
            RollbackTarget::Ref(reference) => self.git.resolve(reference)?,
            RollbackTarget::Steps(0) => {
                return Err(OpsError::config("--steps must be at least 1"));
            }
            RollbackTarget::Steps(steps) => self.git.first_parent_ancestor(*steps)?,
        };

        Ok(RollbackPlan {
            from,
            to,
            mode,
            port,
        })
    }

    /// Plans and, unless `dry_run`, executes a rollback.
    pub fn run(
        &self,
        target: &RollbackTarget,
        mode: ServerMode,
        port: u16,
        dry_run: bool,
        force: bool,
    ) -> Result<RollbackOutcome> {
        let plan = self.plan(target, mode, port)?;
        let runtime = self.supervisor.runtime();
        runtime.ensure()?;

        if plan.is_noop() {
            info!("Already at {}; nothing to roll back", short(&plan.to));
            if dry_run {
                return Ok(RollbackOutcome::Planned { plan, dirty: false });
            }
            let state = RollbackState::from_plan(&plan, RollbackStatus::Noop, None, None);
            state.save(runtime)?;
            return Ok(RollbackOutcome::Completed(state));
        }

        let dirty = self.git.is_dirty()?;
        if dry_run {
            info!("[dry-run] Rollback plan: {plan}");
            if dirty {
                warn!("[dry-run] Working tree has uncommitted changes; --force would discard them");
            }
            return Ok(RollbackOutcome::Planned { plan, dirty });
        }

        if dirty && !force {
            let err = OpsError::DirtyWorkingTree;
            RollbackState::from_plan(&plan, RollbackStatus::Failed, None, Some(err.to_string()))
                .save(runtime)?;
            return Err(err);
        }

        info!("Rolling back: {plan}");
        match self.execute(&plan) {
            Ok(health) => {
                let state =
                    RollbackState::from_plan(&plan, RollbackStatus::Success, Some(health), None);
                state.save(runtime)?;
                info!("Rollback to {} complete", short(&plan.to));
                Ok(RollbackOutcome::Completed(state))
            }
            Err(err) => {
                error!("Rollback to {} failed: {err}", short(&plan.to));
                let health = crate::health::load_state(runtime).ok().flatten();
                RollbackState::from_plan(&plan, RollbackStatus::Failed, health, Some(err.to_string()))
                    .save(runtime)?;
                Err(err)
            }
        }
    }

    fn execute(&self, plan: &RollbackPlan) -> Result<HealthState> {
        let settings = self.supervisor.settings();
        let runtime = self.supervisor.runtime();

        self.supervisor.stop(&StopOptions {
            port: plan.port,
            force: false,
        })?;
        self.git.checkout_detached(&plan.to)?;

        run_command(
            &settings.commands.install,
            &settings.project_dir,
            &[],
            &runtime.server_log_file(),
            None,
        )?;

        let options = StartOptions {
            port: plan.port,
            force: true,
            ..StartOptions::from_settings(settings, plan.mode)
        };
        self.supervisor.start(&options)?;

        let health = self
            .supervisor
            .evaluator()?
            .check_and_persist(runtime, &settings.host, plan.port, plan.mode)?;
        if !health.healthy() {
            return Err(OpsError::RollbackFailed(format!(
                "server unhealthy after checkout of {}: {}",
                short(&plan.to),
                health.summary()
            )));
        }
        Ok(health)
    }
}

/// Returns whether `dir` is inside a git work tree.
pub fn is_repository(dir: &Path) -> bool {
    Git::new(dir)
        .run(&["rev-parse", "--is-inside-work-tree"])
        .is_ok_and(|out| out == "true")
}
