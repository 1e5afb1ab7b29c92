//! Health contract HTTP endpoint.
//!
//! Runs independently of the dashboard server and re-checks the target on
//! every status or readiness request, so probes stay meaningful even when the
//! dashboard's own routes are broken.
use std::{future::Future, io, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::{ServerMode, Settings},
    constants::{CONTRACT_HTTP_TIMEOUT, CONTRACT_VERSION, SERVICE_NAME},
    error::{OpsError, Result},
    health::{self, HealthEvaluator, HealthState, HttpStatus, PortStatus},
    inspector::InspectorChain,
    runtime::RuntimeDirectory,
};

/// Shared state behind every route.
pub struct EndpointState {
    host: String,
    port: u16,
    version: String,
    runtime: RuntimeDirectory,
    inspector: Arc<InspectorChain>,
}

impl EndpointState {
    pub fn new(settings: &Settings, runtime: RuntimeDirectory, inspector: Arc<InspectorChain>) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            version: settings.app_version(),
            runtime,
            inspector,
        }
    }

    fn mode(&self) -> ServerMode {
        health::load_state(&self.runtime)
            .ok()
            .flatten()
            .map(|state| state.mode)
            .unwrap_or(ServerMode::Stopped)
    }

    /// Port and HTTP check against the target. Blocking.
    fn evaluate(&self) -> HealthState {
        let mode = self.mode();
        match HealthEvaluator::new(Arc::clone(&self.inspector), CONTRACT_HTTP_TIMEOUT) {
            Ok(evaluator) => evaluator.check_health(&self.host, self.port, mode),
            Err(err) => self.unknown(mode, err.to_string()),
        }
    }

    fn unknown(&self, mode: ServerMode, error: String) -> HealthState {
        HealthState::new(
            &self.host,
            self.port,
            PortStatus::Unknown,
            HttpStatus::Unknown,
            None,
            mode,
            Some(error),
        )
    }
}

/// Full health contract document.
#[derive(Debug, Serialize)]
pub struct ContractStatus {
    pub contract_version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub service: ServiceInfo,
    pub status: StatusBlock,
    pub checks: Checks,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: String,
    pub mode: ServerMode,
}

#[derive(Debug, Serialize)]
pub struct StatusBlock {
    pub healthy: bool,
    pub port_status: PortStatus,
    pub http_status: HttpStatus,
    pub pid: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct Checks {
    pub port: Check<PortStatus>,
    pub http: Check<HttpStatus>,
}

#[derive(Debug, Serialize)]
pub struct Check<S> {
    pub status: S,
    pub target: String,
}

impl ContractStatus {
    fn from_state(state: HealthState, version: &str) -> Self {
        let address = format!("{}:{}", state.host, state.port);
        Self {
            contract_version: CONTRACT_VERSION,
            timestamp: state.timestamp,
            service: ServiceInfo {
                name: SERVICE_NAME,
                version: version.to_string(),
                mode: state.mode,
            },
            status: StatusBlock {
                healthy: state.healthy(),
                port_status: state.port_status,
                http_status: state.http_status,
                pid: state.pid,
            },
            checks: Checks {
                port: Check {
                    status: state.port_status,
                    target: address.clone(),
                },
                http: Check {
                    status: state.http_status,
                    target: format!("http://{address}/"),
                },
            },
            error: state.error,
        }
    }
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
}

#[derive(Debug, Serialize)]
struct Liveness {
    alive: bool,
}

#[derive(Debug, Serialize)]
struct VersionInfo {
    contract_version: &'static str,
    service: &'static str,
    version: String,
}

async fn check(state: Arc<EndpointState>) -> HealthState {
    let worker = Arc::clone(&state);
    match tokio::task::spawn_blocking(move || worker.evaluate()).await {
        Ok(health) => health,
        Err(err) => {
            warn!("Health check task failed: {err}");
            state.unknown(ServerMode::Stopped, err.to_string())
        }
    }
}

async fn status_handler(State(state): State<Arc<EndpointState>>) -> impl IntoResponse {
    let version = state.version.clone();
    let health = check(state).await;
    Json(ContractStatus::from_state(health, &version))
}

async fn ready_handler(State(state): State<Arc<EndpointState>>) -> impl IntoResponse {
    let ready = check(state).await.healthy();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(Readiness { ready }))
}

async fn live_handler() -> impl IntoResponse {
    Json(Liveness { alive: true })
}

async fn version_handler(State(state): State<Arc<EndpointState>>) -> impl IntoResponse {
    Json(VersionInfo {
        contract_version: CONTRACT_VERSION,
        service: SERVICE_NAME,
        version: state.version.clone(),
    })
}

pub fn router(state: Arc<EndpointState>) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(status_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

/// Serves the contract on `listener` until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: Arc<EndpointState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down health endpoint");
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Rejects a listen address that is also the target: every status request
/// would then check itself recursively.
fn ensure_distinct_target(state: &EndpointState, host: &str, listen_port: u16) -> Result<()> {
    let wildcard = matches!(host, "0.0.0.0" | "::");
    let same_host =
        wildcard || host == state.host || (is_loopback(host) && is_loopback(&state.host));
    if listen_port == state.port && same_host {
        return Err(OpsError::config(format!(
            "health endpoint cannot listen on its target {}:{}",
            state.host, state.port
        )));
    }
    Ok(())
}

/// Binds `host:listen_port` and serves until Ctrl-C or SIGTERM.
pub fn serve(state: EndpointState, host: &str, listen_port: u16) -> Result<()> {
    ensure_distinct_target(&state, host, listen_port)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let addr = format!("{host}:{listen_port}");
        let listener = TcpListener::bind(&addr).await.map_err(|err| {
            if err.kind() == io::ErrorKind::AddrInUse {
                OpsError::PortInUse {
                    port: listen_port,
                    pid: None,
                }
            } else {
                err.into()
            }
        })?;
        info!(
            "Health endpoint listening on {addr} (target {}:{})",
            state.host, state.port
        );
        run(listener, Arc::new(state), shutdown_signal()).await
    })
}
