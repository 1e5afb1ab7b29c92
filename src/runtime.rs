//! Runtime directory holding every shared lock, PID and state file.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use crate::constants::{
    BACKUPS_DIR_NAME, CURRENT_STATE_FILE_NAME, DEPLOY_DIR_NAME, DEPLOY_LOCK_FILE_NAME,
    ENV_RUNTIME_DIR, HEALTH_STATE_FILE_NAME, JOURNAL_FILE_NAME, LOCK_FILE_NAME,
    LOG_DIR_NAME, PID_FILE_NAME, ROLLBACK_STATE_FILE_NAME, RUNTIME_DIR_NAME,
    SERVER_LOG_FILE_NAME, WATCHDOG_LOG_FILE_NAME, WATCHDOG_PID_FILE_NAME,
    WATCHDOG_STATE_FILE_NAME,
};

/// Explicit context wrapping the paths shared between invocations.
///
/// Every component takes a `RuntimeDirectory` instead of reaching for global
/// paths, so the set of files an operation touches is visible at the call site.
/// The directory must live on a filesystem shared by every invocation (CLI,
/// cron, watchdog, CI) so that they coordinate through the same files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDirectory {
    root: PathBuf,
}

impl RuntimeDirectory {
    /// Wraps an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the runtime directory: explicit override, then
    /// `CLAWSUITE_RUNTIME_DIR`, then `<project>/.clawops`.
    pub fn resolve(explicit: Option<&Path>, project_dir: &Path) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }

        match env::var_os(ENV_RUNTIME_DIR) {
            Some(value) if !value.is_empty() => Self::new(PathBuf::from(value)),
            _ => Self::new(project_dir.join(RUNTIME_DIR_NAME)),
        }
    }

    /// Creates the directory tree.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Supervisor lock (PID text).
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    /// Server PID file (PID text).
    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE_NAME)
    }

    /// Canonical health snapshot.
    pub fn health_state_file(&self) -> PathBuf {
        self.root.join(HEALTH_STATE_FILE_NAME)
    }

    /// Outcome of the last git rollback.
    pub fn rollback_state_file(&self) -> PathBuf {
        self.root.join(ROLLBACK_STATE_FILE_NAME)
    }

    pub fn watchdog_pid_file(&self) -> PathBuf {
        self.root.join(WATCHDOG_PID_FILE_NAME)
    }

    pub fn watchdog_state_file(&self) -> PathBuf {
        self.root.join(WATCHDOG_STATE_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR_NAME)
    }

    pub fn server_log_file(&self) -> PathBuf {
        self.log_dir().join(SERVER_LOG_FILE_NAME)
    }

    pub fn watchdog_log_file(&self) -> PathBuf {
        self.log_dir().join(WATCHDOG_LOG_FILE_NAME)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.root.join(DEPLOY_DIR_NAME)
    }

    pub fn journal_file(&self) -> PathBuf {
        self.deploy_dir().join(JOURNAL_FILE_NAME)
    }

    pub fn current_state_file(&self) -> PathBuf {
        self.deploy_dir().join(CURRENT_STATE_FILE_NAME)
    }

    pub fn deploy_lock_file(&self) -> PathBuf {
        self.root.join(DEPLOY_LOCK_FILE_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.deploy_dir().join(BACKUPS_DIR_NAME)
    }
}
