//! Two-layer health evaluation (TCP, then HTTP) and the persisted
//! [`HealthState`] snapshot.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{blocking::Client, redirect::Policy};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::{
    config::ServerMode,
    error::Result,
    fsutil::{read_json, write_json_atomic},
    inspector::{InspectorChain, tcp_reachable},
    runtime::RuntimeDirectory,
};

/// Result of the TCP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortStatus {
    Listening,
    NotListening,
    Unknown,
}

/// Result of the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HttpStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Canonical health snapshot. `healthy` is always derived from the two layers,
/// including when a snapshot is read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredHealthState")]
pub struct HealthState {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub port: u16,
    pub port_status: PortStatus,
    pub http_status: HttpStatus,
    healthy: bool,
    pub pid: Option<u32>,
    pub mode: ServerMode,
    pub error: Option<String>,
}

/// On-disk form; a recorded `healthy` flag is ignored.
#[derive(Deserialize)]
struct StoredHealthState {
    timestamp: DateTime<Utc>,
    host: String,
    port: u16,
    port_status: PortStatus,
    http_status: HttpStatus,
    pid: Option<u32>,
    mode: ServerMode,
    error: Option<String>,
}

impl From<StoredHealthState> for HealthState {
    fn from(stored: StoredHealthState) -> Self {
        Self {
            timestamp: stored.timestamp,
            ..Self::new(
                &stored.host,
                stored.port,
                stored.port_status,
                stored.http_status,
                stored.pid,
                stored.mode,
                stored.error,
            )
        }
    }
}

impl HealthState {
    pub fn new(
        host: &str,
        port: u16,
        port_status: PortStatus,
        http_status: HttpStatus,
        pid: Option<u32>,
        mode: ServerMode,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            host: host.to_string(),
            port,
            port_status,
            http_status,
            healthy: port_status == PortStatus::Listening && http_status == HttpStatus::Healthy,
            pid,
            mode,
            error,
        }
    }

    /// Terminal snapshot written by `stop`.
    pub fn stopped(host: &str, port: u16) -> Self {
        Self::new(
            host,
            port,
            PortStatus::NotListening,
            HttpStatus::Unknown,
            None,
            ServerMode::Stopped,
            None,
        )
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn with_mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let verdict = if self.healthy { "healthy" } else { "unhealthy" };
        let pid = self
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "{verdict}: {}:{} port={} http={} pid={pid} mode={}",
            self.host, self.port, self.port_status, self.http_status, self.mode
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{error}\""));
        }
        line
    }
}

/// Reads the persisted snapshot, if any.
pub fn load_state(runtime: &RuntimeDirectory) -> Result<Option<HealthState>> {
    read_json(&runtime.health_state_file())
}

/// Overwrites the persisted snapshot.
pub fn persist_state(runtime: &RuntimeDirectory, state: &HealthState) -> Result<()> {
    write_json_atomic(&runtime.health_state_file(), state)?;
    debug!("Persisted health state: {}", state.summary());
    Ok(())
}

/// Performs port and HTTP checks against a target.
pub struct HealthEvaluator {
    client: Client,
    timeout: Duration,
    inspector: Arc<InspectorChain>,
    path: String,
}

impl HealthEvaluator {
    /// Builds an evaluator whose TCP and HTTP connects are bounded by
    /// `timeout`. Must not be called from inside an async runtime.
    pub fn new(inspector: Arc<InspectorChain>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            timeout,
            inspector,
            path: "/".to_string(),
        })
    }

    /// Probes `path` instead of the root path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        self
    }

    /// Evaluates `host:port` without touching shared state.
    pub fn check_health(&self, host: &str, port: u16, mode: ServerMode) -> HealthState {
        if !tcp_reachable(host, port, self.timeout) {
            return HealthState::new(
                host,
                port,
                PortStatus::NotListening,
                HttpStatus::Unknown,
                None,
                mode,
                Some(format!("port {port} is not accepting connections")),
            );
        }

        let (http_status, error) = self.probe_http(host, port);
        let pid = match self.inspector.find_process_on_port(port) {
            Ok(handle) => handle.pid,
            Err(err) => {
                debug!("Could not resolve owner of port {port}: {err}");
                None
            }
        };

        HealthState::new(
            host,
            port,
            PortStatus::Listening,
            http_status,
            pid,
            mode,
            error,
        )
    }

    /// Evaluates `host:port` and overwrites the persisted snapshot.
    pub fn check_and_persist(
        &self,
        runtime: &RuntimeDirectory,
        host: &str,
        port: u16,
        mode: ServerMode,
    ) -> Result<HealthState> {
        let state = self.check_health(host, port, mode);
        persist_state(runtime, &state)?;
        Ok(state)
    }

    fn probe_http(&self, host: &str, port: u16) -> (HttpStatus, Option<String>) {
        let url = format!("http://{}:{port}{}", url_host(host), self.path);
        match self.client.get(&url).send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    (HttpStatus::Healthy, None)
                } else {
                    (
                        HttpStatus::Unhealthy,
                        Some(format!("GET {url} returned {status}")),
                    )
                }
            }
            Err(err) => {
                warn!("HTTP probe of {url} failed: {err}");
                (
                    HttpStatus::Unhealthy,
                    Some(format!("GET {url} failed: {err}")),
                )
            }
        }
    }
}

fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
