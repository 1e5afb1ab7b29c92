//! Port/process inspection.
//!
//! Locates the process listening on a TCP port. Several capabilities are
//! supported; an [`InspectorChain`] probes them once, in preference order, and
//! keeps the first available one for the lifetime of the process. Observations
//! themselves are never cached: every call reflects current OS state.
use std::{
    collections::HashSet,
    env, fs,
    net::{TcpStream, ToSocketAddrs},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use regex::Regex;
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::error::{OpsError, Result};

/// The OS process believed to own a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    /// Owning PID when the capability can recover it.
    pub pid: Option<u32>,
    pub port: u16,
    /// Whether anything listens on the port at all.
    pub listening: bool,
}

impl ProcessHandle {
    pub fn absent(port: u16) -> Self {
        Self {
            pid: None,
            port,
            listening: false,
        }
    }

    pub fn listening(port: u16, pid: Option<u32>) -> Self {
        Self {
            pid,
            port,
            listening: true,
        }
    }
}

/// Supported inspection capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum InspectorKind {
    /// Linux `/proc/net/tcp*` socket tables.
    Proc,
    /// iproute2 `ss`.
    Ss,
    /// `lsof`.
    Lsof,
    /// Plain TCP connect; reachability only, never a PID.
    Connect,
}

impl InspectorKind {
    /// Default preference order for this platform.
    pub fn default_order() -> Vec<Self> {
        if cfg!(target_os = "linux") {
            vec![Self::Proc, Self::Ss, Self::Lsof, Self::Connect]
        } else {
            vec![Self::Lsof, Self::Ss, Self::Connect]
        }
    }

    fn build(self, host: &str) -> Box<dyn PortInspector> {
        match self {
            Self::Proc => Box::new(ProcInspector::new("/proc")),
            Self::Ss => Box::new(SsInspector::default()),
            Self::Lsof => Box::new(LsofInspector),
            Self::Connect => Box::new(ConnectInspector::new(host, Duration::from_secs(1))),
        }
    }
}

/// Capability that maps a port to its owning process.
pub trait PortInspector: Send + Sync {
    fn kind(&self) -> InspectorKind;

    /// Whether the capability can run on this host.
    fn is_available(&self) -> bool;

    /// Finds the listener on `port`. Absence is `Ok`, never an error.
    fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle>;
}

/// The inspector selected for this process.
pub struct InspectorChain {
    active: Box<dyn PortInspector>,
}

impl std::fmt::Debug for InspectorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectorChain")
            .field("active", &self.active.kind())
            .finish()
    }
}

impl InspectorChain {
    /// Probes `kinds` in order and keeps the first available capability.
    pub fn detect(kinds: &[InspectorKind], host: &str) -> Result<Self> {
        for kind in kinds {
            let candidate = kind.build(host);
            if candidate.is_available() {
                debug!("Using '{kind}' port inspector");
                return Ok(Self { active: candidate });
            }
            debug!("Port inspector '{kind}' unavailable");
        }

        let tried: Vec<_> = kinds.iter().map(|kind| kind.to_string()).collect();
        Err(OpsError::ToolingUnavailable(format!(
            "none of [{}] is usable on this host",
            tried.join(", ")
        )))
    }

    /// Wraps an explicit inspector.
    pub fn with_inspector(inspector: Box<dyn PortInspector>) -> Self {
        Self { active: inspector }
    }

    pub fn kind(&self) -> InspectorKind {
        self.active.kind()
    }

    pub fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle> {
        self.active.find_process_on_port(port)
    }
}

/// Returns whether `name` resolves to an executable on `PATH`.
fn command_exists(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        fs::metadata(&candidate)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

// ============================================================================
// /proc
// ============================================================================

/// Reads the kernel socket tables directly.
pub struct ProcInspector {
    root: PathBuf,
}

const TCP_LISTEN_STATE: &str = "0A";

impl ProcInspector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Inodes of sockets listening on `port` in the given table.
    fn listening_inodes(table: &str, port: u16) -> HashSet<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN_STATE {
                    return None;
                }
                let (_, hex_port) = fields[1].rsplit_once(':')?;
                let local_port = u16::from_str_radix(hex_port, 16).ok()?;
                if local_port != port {
                    return None;
                }
                fields[9].parse::<u64>().ok()
            })
            .collect()
    }

    fn owners(&self, inodes: &HashSet<u64>) -> Option<u32> {
        let entries = fs::read_dir(&self.root).ok()?;
        let mut owners: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| self.owns_any(*pid, inodes))
            .collect();
        owners.sort_unstable();
        owners.first().copied()
    }

    fn owns_any(&self, pid: u32, inodes: &HashSet<u64>) -> bool {
        let Ok(fds) = fs::read_dir(self.root.join(pid.to_string()).join("fd")) else {
            return false;
        };
        fds.filter_map(|fd| fd.ok())
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .filter_map(|target| socket_inode(&target))
            .any(|inode| inodes.contains(&inode))
    }
}

fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

impl PortInspector for ProcInspector {
    fn kind(&self) -> InspectorKind {
        InspectorKind::Proc
    }

    fn is_available(&self) -> bool {
        self.root.join("net/tcp").exists()
    }

    fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle> {
        let mut inodes = HashSet::new();
        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(contents) = fs::read_to_string(self.root.join(table)) {
                inodes.extend(Self::listening_inodes(&contents, port));
            }
        }

        if inodes.is_empty() {
            return Ok(ProcessHandle::absent(port));
        }

        Ok(ProcessHandle::listening(port, self.owners(&inodes)))
    }
}

// ============================================================================
// ss
// ============================================================================

/// Parses `ss -ltnpH` output.
pub struct SsInspector {
    pid_pattern: Option<Regex>,
}

impl Default for SsInspector {
    fn default() -> Self {
        Self {
            pid_pattern: Regex::new(r"pid=(\d+)").ok(),
        }
    }
}

impl SsInspector {
    fn parse(&self, output: &str, port: u16) -> ProcessHandle {
        let suffix = format!(":{port}");
        let mut listening = false;
        let mut pid = None;

        for line in output.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // State Recv-Q Send-Q Local:Port Peer:Port [Process]
            let Some(local) = fields.get(3) else {
                continue;
            };
            if !local.ends_with(&suffix) {
                continue;
            }
            listening = true;
            if pid.is_none()
                && let Some(pattern) = &self.pid_pattern
            {
                pid = pattern
                    .captures(line)
                    .and_then(|caps| caps[1].parse::<u32>().ok());
            }
        }

        if listening {
            ProcessHandle::listening(port, pid)
        } else {
            ProcessHandle::absent(port)
        }
    }
}

impl PortInspector for SsInspector {
    fn kind(&self) -> InspectorKind {
        InspectorKind::Ss
    }

    fn is_available(&self) -> bool {
        command_exists("ss")
    }

    fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle> {
        let output = Command::new("ss")
            .args(["-ltnpH", "sport", "=", &format!(":{port}")])
            .stdin(Stdio::null())
            .output()?;
        Ok(self.parse(&String::from_utf8_lossy(&output.stdout), port))
    }
}

// ============================================================================
// lsof
// ============================================================================

/// Uses `lsof -t` for listening TCP sockets.
pub struct LsofInspector;

impl LsofInspector {
    fn parse(output: &str, port: u16) -> ProcessHandle {
        let mut pids: Vec<u32> = output
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect();
        pids.sort_unstable();

        match pids.first() {
            Some(pid) => ProcessHandle::listening(port, Some(*pid)),
            None => ProcessHandle::absent(port),
        }
    }
}

impl PortInspector for LsofInspector {
    fn kind(&self) -> InspectorKind {
        InspectorKind::Lsof
    }

    fn is_available(&self) -> bool {
        command_exists("lsof")
    }

    fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle> {
        // Exit status 1 means "nothing matched".
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .stdin(Stdio::null())
            .output()?;
        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout), port))
    }
}

// ============================================================================
// TCP connect
// ============================================================================

/// Reachability-only fallback.
pub struct ConnectInspector {
    host: String,
    timeout: Duration,
}

impl ConnectInspector {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            timeout,
        }
    }
}

impl PortInspector for ConnectInspector {
    fn kind(&self) -> InspectorKind {
        InspectorKind::Connect
    }

    fn is_available(&self) -> bool {
        true
    }

    fn find_process_on_port(&self, port: u16) -> Result<ProcessHandle> {
        if tcp_reachable(&self.host, port, self.timeout) {
            Ok(ProcessHandle::listening(port, None))
        } else {
            Ok(ProcessHandle::absent(port))
        }
    }
}

/// Attempts a TCP connection to `host:port` on any resolved address.
pub fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
