//! Error handling for clawops.
use std::path::PathBuf;

use thiserror::Error;

/// Exit code for a runtime failure.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code for invalid configuration, invalid input or missing tooling.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code when another live process owns the lock.
pub const EXIT_LOCKED: u8 = 3;

/// Defines all possible errors raised by the lifecycle tooling.
#[derive(Debug, Error)]
pub enum OpsError {
    /// Invalid mode, port, interval or other user supplied setting.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Another live process owns the lock file.
    #[error("Lock {} is held by live process {pid}", .path.display())]
    LockContention {
        /// The lock file path.
        path: PathBuf,
        /// PID recorded by the current owner.
        pid: u32,
    },

    /// No supported port or HTTP inspection capability is present.
    #[error("No supported inspection tool available: {0}")]
    ToolingUnavailable(String),

    /// The target port is occupied and `--force` was not given.
    #[error("Port {port} is already in use by {}", describe_pid(.pid))]
    PortInUse {
        /// The requested port.
        port: u16,
        /// The occupant, when it could be resolved.
        pid: Option<u32>,
    },

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed with exit code {code:?}")]
    CommandFailed {
        /// The shell command that was run.
        command: String,
        /// Exit code, `None` when terminated by a signal or timed out.
        code: Option<i32>,
    },

    /// The server never became healthy within the retry budget.
    #[error("Server on port {port} not healthy after {attempts} attempts")]
    HealthTimeout {
        /// The probed port.
        port: u16,
        /// Number of probes issued.
        attempts: usize,
    },

    /// A process could not be signalled or refused to exit.
    #[error("Failed to stop PID {pid}: {source}")]
    StopFailed {
        /// The target PID.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Failed to launch the server process.
    #[error("Failed to launch `{command}`: {source}")]
    LaunchFailed {
        /// The shell command that was run.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A deployment phase failed.
    #[error("Deployment phase '{phase}' failed: {reason}")]
    Deployment {
        /// The failing phase (`build`, `server_start`, `health_check`).
        phase: String,
        /// Human readable reason.
        reason: String,
    },

    /// A rollback could not produce a healthy system.
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// The requested transaction has no backup on disk.
    #[error("No backup found for transaction '{0}'")]
    NoBackup(String),

    /// The git working tree has uncommitted changes.
    #[error("Working tree has uncommitted changes; commit, stash or pass --force")]
    DirtyWorkingTree,

    /// A git invocation failed.
    #[error("git: {0}")]
    Git(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation error.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Error building the HTTP client.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error returned by a system call.
    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),
}

fn describe_pid(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("PID {pid}"),
        None => "an unknown process".to_string(),
    }
}

impl OpsError {
    /// Maps the error onto the process exit code contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            OpsError::Config(_) | OpsError::ToolingUnavailable(_) => EXIT_CONFIG,
            OpsError::LockContention { .. } => EXIT_LOCKED,
            _ => EXIT_FAILURE,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        OpsError::Config(message.into())
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = OpsError> = std::result::Result<T, E>;
