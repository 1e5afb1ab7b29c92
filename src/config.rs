//! Configuration management for clawops.
//!
//! Settings are resolved in layers: built-in defaults, an optional YAML file,
//! `CLAWSUITE_*` environment overrides, then command-line flags (applied by the
//! caller through the `with_*` builders).
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{
    constants::{
        CONFIG_FILE_NAME, DEFAULT_BACKUP_PATHS, DEFAULT_BUILD_COMMAND, DEFAULT_CLEAN_PATHS,
        DEFAULT_DEV_COMMAND, DEFAULT_HEALTH_PORT, DEFAULT_HOST, DEFAULT_INSTALL_COMMAND,
        DEFAULT_PORT, DEFAULT_PREVIEW_COMMAND, ENV_CONFIG, ENV_HEALTH_PORT, ENV_HOST,
        ENV_PORT, HEALTH_WAIT_ATTEMPTS, HEALTH_WAIT_INTERVAL, LOCAL_HTTP_TIMEOUT,
        TERMINATE_CHECKS, TERMINATE_INTERVAL,
    },
    error::{OpsError, Result},
    inspector::InspectorKind,
};

/// How the dashboard server is (or was) run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ServerMode {
    /// Development server with hot reload.
    Dev,
    /// Built artifact served by the preview server.
    Preview,
    /// Nothing is running.
    Stopped,
}

impl ServerMode {
    /// Whether this mode serves a build artifact that must be produced first.
    pub fn requires_build(self) -> bool {
        matches!(self, ServerMode::Preview)
    }
}

/// Parses a mode accepted for launching a server (`dev` or `preview`).
pub fn parse_launch_mode(value: &str) -> Result<ServerMode> {
    match ServerMode::from_str(value.trim()) {
        Ok(ServerMode::Stopped) | Err(_) => Err(OpsError::config(format!(
            "invalid mode '{value}', expected 'dev' or 'preview'"
        ))),
        Ok(mode) => Ok(mode),
    }
}

/// Parses a TCP port, rejecting zero.
pub fn parse_port(value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(OpsError::config(format!(
            "invalid port '{value}', expected 1-65535"
        ))),
        Ok(port) => Ok(port),
    }
}

fn nonzero_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(OpsError::config("port 0 is not a valid target"));
    }
    Ok(port)
}

/// External commands run on behalf of the dashboard.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    pub dev: String,
    pub preview: String,
    pub build: String,
    pub install: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            dev: DEFAULT_DEV_COMMAND.to_string(),
            preview: DEFAULT_PREVIEW_COMMAND.to_string(),
            build: DEFAULT_BUILD_COMMAND.to_string(),
            install: DEFAULT_INSTALL_COMMAND.to_string(),
        }
    }
}

impl CommandsConfig {
    /// Returns the launch command for `mode`.
    pub fn for_mode(&self, mode: ServerMode) -> Result<&str> {
        match mode {
            ServerMode::Dev => Ok(&self.dev),
            ServerMode::Preview => Ok(&self.preview),
            ServerMode::Stopped => Err(OpsError::config("cannot launch in 'stopped' mode")),
        }
    }
}

/// Health wait tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HealthWaitFile {
    attempts: Option<usize>,
    interval_ms: Option<u64>,
}

/// On-disk representation of `clawops.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    health_port: Option<u16>,
    commands: Option<CommandsConfig>,
    clean_paths: Option<Vec<String>>,
    backup_paths: Option<Vec<String>>,
    inspectors: Option<Vec<String>>,
    health_wait: HealthWaitFile,
    http_timeout_secs: Option<u64>,
}

/// Fully resolved settings shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the dashboard checkout; commands run here.
    pub project_dir: PathBuf,
    /// Target host of the dashboard server.
    pub host: String,
    /// Target port of the dashboard server.
    pub port: u16,
    /// Port of the health contract endpoint.
    pub health_port: u16,
    pub commands: CommandsConfig,
    /// Removed by `start --clean`, relative to `project_dir`.
    pub clean_paths: Vec<PathBuf>,
    /// Captured into deployment backups, relative to `project_dir`.
    pub backup_paths: Vec<PathBuf>,
    /// Port inspector preference order.
    pub inspectors: Vec<InspectorKind>,
    pub health_wait_attempts: usize,
    pub health_wait_interval: Duration,
    /// Connect timeout for local HTTP probes.
    pub http_timeout: Duration,
    pub terminate_checks: usize,
    pub terminate_interval: Duration,
}

impl Settings {
    /// Built-in defaults rooted at `project_dir`.
    pub fn defaults(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            health_port: DEFAULT_HEALTH_PORT,
            commands: CommandsConfig::default(),
            clean_paths: DEFAULT_CLEAN_PATHS.iter().map(PathBuf::from).collect(),
            backup_paths: DEFAULT_BACKUP_PATHS.iter().map(PathBuf::from).collect(),
            inspectors: InspectorKind::default_order(),
            health_wait_attempts: HEALTH_WAIT_ATTEMPTS,
            health_wait_interval: HEALTH_WAIT_INTERVAL,
            http_timeout: LOCAL_HTTP_TIMEOUT,
            terminate_checks: TERMINATE_CHECKS,
            terminate_interval: TERMINATE_INTERVAL,
        }
    }

    /// Loads defaults, the config file (if any) and environment overrides.
    ///
    /// The config file is `config_path` when given, else `CLAWOPS_CONFIG`, else
    /// `<project_dir>/clawops.yaml` when present.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::defaults(project_dir);

        let candidate = config_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(ENV_CONFIG).map(PathBuf::from))
            .or_else(|| {
                let default = project_dir.join(CONFIG_FILE_NAME);
                default.exists().then_some(default)
            });

        if let Some(path) = candidate {
            settings.apply_file(&path)?;
        }

        settings.apply_env()?;
        Ok(settings)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|e| {
            OpsError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let expanded = expand_env_vars(&content)?;
        let file: ConfigFile = serde_yaml::from_str(&expanded).map_err(|e| {
            OpsError::config(format!("invalid config file {}: {e}", path.display()))
        })?;

        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = nonzero_port(port)?;
        }
        if let Some(port) = file.health_port {
            self.health_port = nonzero_port(port)?;
        }
        if let Some(commands) = file.commands {
            self.commands = commands;
        }
        if let Some(paths) = file.clean_paths {
            self.clean_paths = paths.into_iter().map(PathBuf::from).collect();
        }
        if let Some(paths) = file.backup_paths {
            self.backup_paths = paths.into_iter().map(PathBuf::from).collect();
        }
        if let Some(names) = file.inspectors {
            self.inspectors = names
                .iter()
                .map(|name| {
                    InspectorKind::from_str(name).map_err(|_| {
                        OpsError::config(format!("unknown inspector '{name}'"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(attempts) = file.health_wait.attempts {
            self.health_wait_attempts = attempts.max(1);
        }
        if let Some(interval) = file.health_wait.interval_ms {
            self.health_wait_interval = Duration::from_millis(interval);
        }
        if let Some(secs) = file.http_timeout_secs {
            if secs == 0 {
                return Err(OpsError::config("http_timeout_secs must be positive"));
            }
            self.http_timeout = Duration::from_secs(secs);
        }

        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var(ENV_HOST)
            && !host.trim().is_empty()
        {
            self.host = host.trim().to_string();
        }
        if let Ok(port) = env::var(ENV_PORT) {
            self.port = parse_port(&port)?;
        }
        if let Ok(port) = env::var(ENV_HEALTH_PORT) {
            self.health_port = parse_port(&port)?;
        }
        Ok(())
    }

    /// Applies command-line overrides for the target.
    pub fn with_target(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn with_health_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.health_port = port;
        }
        self
    }

    /// Resolves a project-relative path.
    pub fn project_path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.project_dir.join(relative)
        }
    }

    /// Reads the `version` field from the project's `package.json`.
    pub fn app_version(&self) -> String {
        fs::read_to_string(self.project_dir.join("package.json"))
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|json| json.get("version")?.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Expands `${VAR}` references. Bare `$VAR` is left for the shell.
fn expand_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| OpsError::config(e.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(OpsError::config(format!(
            "missing environment variable: {name}"
        ))),
        None => Ok(result.into_owned()),
    }
}
