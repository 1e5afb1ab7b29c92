//! Constants and default values for clawops.
//!
//! This module centralizes file names, timings, thresholds and environment
//! variable names so every component observes the same defaults.

use std::time::Duration;

// ============================================================================
// Network Targets
// ============================================================================

/// Default host the dashboard server binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port of the dashboard server.
pub const DEFAULT_PORT: u16 = 3000;

/// Default port of the health contract endpoint.
pub const DEFAULT_HEALTH_PORT: u16 = 3099;

// ============================================================================
// Environment Variables
// ============================================================================

/// Overrides the target application port.
pub const ENV_PORT: &str = "CLAWSUITE_PORT";

/// Overrides the target application host.
pub const ENV_HOST: &str = "CLAWSUITE_HOST";

/// Overrides the health contract endpoint port.
pub const ENV_HEALTH_PORT: &str = "CLAWSUITE_HEALTH_PORT";

/// Overrides the runtime directory holding lock, PID and state files.
pub const ENV_RUNTIME_DIR: &str = "CLAWSUITE_RUNTIME_DIR";

/// Path to an explicit configuration file.
pub const ENV_CONFIG: &str = "CLAWOPS_CONFIG";

// ============================================================================
// File System Layout
// ============================================================================

/// Runtime directory name, relative to the project directory.
pub const RUNTIME_DIR_NAME: &str = ".clawops";

/// Configuration file looked up in the project directory.
pub const CONFIG_FILE_NAME: &str = "clawops.yaml";

/// Lock file guarding supervisor start/restart.
pub const LOCK_FILE_NAME: &str = "clawops.lock";

/// PID file of the running dashboard server.
pub const PID_FILE_NAME: &str = "clawops.pid";

/// Canonical health snapshot.
pub const HEALTH_STATE_FILE_NAME: &str = "health-state.json";

/// Outcome of the last git rollback.
pub const ROLLBACK_STATE_FILE_NAME: &str = "rollback-state.json";

/// Watchdog single-instance PID/lock file.
pub const WATCHDOG_PID_FILE_NAME: &str = "watchdog.pid";

/// Persisted watchdog failure counters.
pub const WATCHDOG_STATE_FILE_NAME: &str = "watchdog-state.json";

/// Directory holding server and watchdog logs.
pub const LOG_DIR_NAME: &str = "logs";

/// Server stdout/stderr log.
pub const SERVER_LOG_FILE_NAME: &str = "server.log";

/// Watchdog log when daemonized.
pub const WATCHDOG_LOG_FILE_NAME: &str = "watchdog.log";

/// Directory holding the deployment journal and backups.
pub const DEPLOY_DIR_NAME: &str = "deploy";

/// Append-only transaction journal.
pub const JOURNAL_FILE_NAME: &str = "journal.jsonl";

/// Current deployment state pointer.
pub const CURRENT_STATE_FILE_NAME: &str = "current.json";

/// Lock guarding deploy/rollback operations.
pub const DEPLOY_LOCK_FILE_NAME: &str = "deploy.lock";

/// Directory of per-transaction backups.
pub const BACKUPS_DIR_NAME: &str = "backups";

/// Metadata file written into each backup.
pub const BACKUP_METADATA_FILE_NAME: &str = "metadata.json";

/// Number of most recent backups retained after a successful deploy.
pub const BACKUP_RETENTION: usize = 5;

// ============================================================================
// Shell Execution
// ============================================================================

/// Default shell used for server, build and install commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Default command for the development server.
pub const DEFAULT_DEV_COMMAND: &str = "npm run dev -- --port $PORT --host $HOST";

/// Default command for the preview server.
pub const DEFAULT_PREVIEW_COMMAND: &str = "npm run preview -- --port $PORT --host $HOST";

/// Default build command.
pub const DEFAULT_BUILD_COMMAND: &str = "npm run build";

/// Default deterministic dependency install command.
pub const DEFAULT_INSTALL_COMMAND: &str = "npm ci";

/// Paths removed by `start --clean`.
pub const DEFAULT_CLEAN_PATHS: &[&str] =
    &[".output", "dist", "node_modules/.vite", "node_modules/.cache"];

/// Paths captured into each deployment backup.
pub const DEFAULT_BACKUP_PATHS: &[&str] =
    &[".output", "dist", "package.json", "package-lock.json"];

// ============================================================================
// Timing
// ============================================================================

/// Connect timeout for local health probes.
pub const LOCAL_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout used by the health contract endpoint.
pub const CONTRACT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of health probes issued while waiting for a launched server.
pub const HEALTH_WAIT_ATTEMPTS: usize = 30;

/// Interval between health probes while waiting for a launched server.
pub const HEALTH_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Number of liveness checks after SIGTERM before escalating to SIGKILL.
pub const TERMINATE_CHECKS: usize = 10;

/// Interval between liveness checks after SIGTERM.
pub const TERMINATE_INTERVAL: Duration = Duration::from_millis(500);

/// Default deploy health check budget.
pub const DEPLOY_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Watchdog Policy
// ============================================================================

/// Seconds between watchdog cycles.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive failures that trigger a restart.
pub const WATCHDOG_FAILURE_THRESHOLD: u32 = 3;

/// Failures further apart than this are treated as unrelated incidents.
pub const WATCHDOG_DECAY_WINDOW: Duration = Duration::from_secs(300);

/// Granularity at which the watchdog sleep notices a shutdown request.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Health Contract
// ============================================================================

/// Version of the health contract wire format.
pub const CONTRACT_VERSION: &str = "1.0";

/// Service name reported in the health contract.
pub const SERVICE_NAME: &str = "clawsuite";
