//! clawops manages the runtime lifecycle of the ClawSuite dashboard server. It
//! starts and stops the server under a single-owner lock, verifies health with a
//! layered port and HTTP check, restarts it from a watchdog after repeated
//! failures, and deploys new builds through a journaled transaction that rolls
//! back automatically when a phase fails.

/// Pre-deploy snapshots with checksum verification.
pub mod backup;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared defaults, file names and timings.
pub mod constants;

/// Transactional deployments with automatic rollback.
pub mod deploy;

/// Health contract HTTP endpoint.
pub mod endpoint;

/// Error handling.
pub mod error;

/// Atomic file writes and small file helpers.
pub mod fsutil;

/// Git-driven rollback of the project checkout.
pub mod git;

/// Layered port and HTTP health evaluation.
pub mod health;

/// Port-to-process resolution.
pub mod inspector;

/// Append-only deployment journal.
pub mod journal;

/// Exclusive PID lock files.
pub mod lock;

/// Logs management.
pub mod logs;

/// Process spawning and termination.
pub mod process;

/// Bounded retry helper.
pub mod retry;

/// Runtime directory layout.
pub mod runtime;

/// Dashboard server lifecycle.
pub mod supervisor;

/// Failure-counting restart loop.
pub mod watchdog;

#[doc(hidden)]
pub mod test_utils;
