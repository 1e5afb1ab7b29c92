//! Command-line interface for clawops.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{ServerMode, parse_launch_mode, parse_port},
    deploy::HealthTarget,
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for clawops.
#[derive(Parser)]
#[command(name = "clawops", version, author)]
#[command(
    about = "Runtime lifecycle, health checks and deployments for the ClawSuite dashboard",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Directory holding lock, PID, state and journal files.
    #[arg(long, value_name = "DIR", global = true)]
    pub runtime_dir: Option<PathBuf>,

    /// Path to a clawops.yaml configuration file.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// The dashboard project checkout (defaults to the current directory).
    #[arg(long, value_name = "DIR", global = true)]
    pub project_dir: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for clawops.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the dashboard server and wait until it is healthy.
    Start {
        #[arg(short, long, value_parser = parse_port)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Launch mode: dev or preview.
        #[arg(short, long, default_value = "dev", value_parser = parse_launch_mode)]
        mode: ServerMode,

        /// Skip the build step in preview mode.
        #[arg(long = "no-build")]
        no_build: bool,

        /// Remove build output and bundler caches before starting.
        #[arg(long)]
        clean: bool,

        /// Terminate whatever already listens on the port.
        #[arg(short, long)]
        force: bool,
    },

    /// Stop the dashboard server. Stopping a stopped server succeeds.
    Stop {
        #[arg(short, long, value_parser = parse_port)]
        port: Option<u16>,

        /// Kill immediately instead of waiting for a graceful exit.
        #[arg(short, long)]
        force: bool,
    },

    /// Stop and start the dashboard server.
    Restart {
        #[arg(short, long, value_parser = parse_port)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Launch mode; defaults to the mode the server last ran in.
        #[arg(short, long, value_parser = parse_launch_mode)]
        mode: Option<ServerMode>,

        #[arg(long = "no-build")]
        no_build: bool,
    },

    /// Show the recorded server state.
    Status {
        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Check the server's port and HTTP health.
    Health {
        #[arg(short, long, value_parser = parse_port)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Emit the health snapshot as JSON.
        #[arg(long)]
        json: bool,

        /// Persist the result as the canonical health state.
        #[arg(long)]
        state: bool,
    },

    /// Monitor the server and restart it after repeated failures.
    Watchdog {
        /// Seconds between checks.
        #[arg(short, long, value_name = "SECONDS")]
        interval: Option<u64>,

        /// Consecutive failures before a restart.
        #[arg(long)]
        threshold: Option<u32>,

        /// Mode used for restarts; defaults to the recorded mode.
        #[arg(short, long, value_parser = parse_launch_mode)]
        mode: Option<ServerMode>,

        /// Run in the background.
        #[arg(long, conflicts_with_all = ["stop", "status", "once"])]
        daemonize: bool,

        /// Stop a running watchdog.
        #[arg(long, conflicts_with_all = ["status", "once"])]
        stop: bool,

        /// Show watchdog state.
        #[arg(long, conflicts_with = "once")]
        status: bool,

        /// Run a single check cycle and exit.
        #[arg(long)]
        once: bool,

        /// Report decisions without restarting or persisting anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Transactional deployments with automatic rollback.
    Deploy {
        #[command(subcommand)]
        action: DeployCommand,
    },

    /// Roll the checkout back to an earlier git commit.
    Rollback {
        /// Git reference to roll back to.
        #[arg(long, conflicts_with = "steps")]
        to: Option<String>,

        /// Number of first-parent commits to step back (default 1).
        #[arg(long)]
        steps: Option<u32>,

        #[arg(short, long, value_parser = parse_launch_mode)]
        mode: Option<ServerMode>,

        #[arg(short, long, value_parser = parse_port)]
        port: Option<u16>,

        /// Print the plan without changing anything.
        #[arg(long)]
        dry_run: bool,

        /// Discard uncommitted changes.
        #[arg(short, long)]
        force: bool,
    },

    /// Serve the health contract over HTTP.
    Endpoint {
        /// Port to listen on (defaults to the configured health port).
        #[arg(long, value_parser = parse_port)]
        listen_port: Option<u16>,
    },

    /// Show the server log.
    Logs {
        /// Number of lines to show.
        #[arg(short, long, default_value = "50")]
        lines: usize,

        /// Show the watchdog log instead.
        #[arg(long)]
        watchdog: bool,
    },
}

/// Actions under `clawops deploy`.
#[derive(Subcommand)]
pub enum DeployCommand {
    /// Back up, optionally build, restart and verify; roll back on failure.
    Deploy {
        /// Run the build command before restarting.
        #[arg(long)]
        pre_build: bool,

        #[arg(long)]
        no_health_check: bool,

        /// Seconds allowed for the post-deploy health check.
        #[arg(long, value_name = "SECONDS", default_value = "30")]
        timeout: u64,

        #[arg(short, long, default_value = "preview", value_parser = parse_launch_mode)]
        mode: ServerMode,

        /// What the health check probes: contract or app.
        #[arg(long, default_value = "contract")]
        health_target: HealthTarget,
    },

    /// Restore the backup of a transaction.
    Rollback {
        /// Transaction id; defaults to the last successful deploy.
        #[arg(long)]
        to: Option<String>,

        /// Skip post-rollback health verification.
        #[arg(short, long)]
        force: bool,

        #[arg(short, long, value_parser = parse_launch_mode)]
        mode: Option<ServerMode>,
    },

    /// Current state, recent journal entries and backups.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the last N journal entries.
    Journal {
        #[arg(default_value = "20")]
        lines: usize,
    },

    /// Check contract health and deployment files.
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Create the journal, backup directory and state pointer.
    Init,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
