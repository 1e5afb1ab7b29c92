//! Append-only deployment journal and the current-state pointer.
//!
//! The journal is newline-delimited JSON on disk. It is loaded once per
//! [`Journal`] and queried in memory; appends go to both.
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::{
    error::Result,
    fsutil::{read_json, write_json_atomic},
};

/// Phase recorded by a journal entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxAction {
    DeployStart,
    BackupCreated,
    BuildStart,
    BuildComplete,
    ServerStart,
    HealthCheck,
    DeployComplete,
    Rollback,
    ManualRollback,
}

/// Outcome recorded by a journal entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxStatus {
    Started,
    Success,
    Failed,
}

/// One immutable journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: TxAction,
    pub status: TxStatus,
    #[serde(default)]
    pub details: Value,
}

impl Transaction {
    pub fn new(tx_id: &str, action: TxAction, status: TxStatus, details: Value) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            timestamp: Utc::now(),
            action,
            status,
            details,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}

static TX_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Fresh time-derived transaction id. Ids sort chronologically.
pub fn new_transaction_id() -> String {
    let now = Utc::now();
    let seq = TX_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!(
        "tx-{}-{}-{seq:04}",
        now.format("%Y%m%d%H%M%S%3f"),
        std::process::id()
    )
}

/// In-memory view over the on-disk journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    entries: Vec<Transaction>,
}

impl Journal {
    /// Loads the journal at `path`. A missing file is an empty journal.
    /// Unparseable lines are skipped.
    pub fn open(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Transaction>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    "Skipping malformed journal line {} in {}: {err}",
                    index + 1,
                    path.display()
                ),
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Creates the journal file if it does not exist; never truncates.
    pub fn touch(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entry` to disk, then to the in-memory index.
    pub fn append(&mut self, entry: Transaction) -> Result<&Transaction> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        debug!("journal: {} {} {}", entry.tx_id, entry.action, entry.status);
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Shorthand for appending a freshly timestamped entry.
    pub fn record(
        &mut self,
        tx_id: &str,
        action: TxAction,
        status: TxStatus,
        details: Value,
    ) -> Result<&Transaction> {
        self.append(Transaction::new(tx_id, action, status, details))
    }

    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    /// Latest entry satisfying `predicate`.
    pub fn last_matching<P>(&self, predicate: P) -> Option<&Transaction>
    where
        P: Fn(&Transaction) -> bool,
    {
        self.entries.iter().rev().find(|entry| predicate(*entry))
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[Transaction] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }
}

/// Deployment lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeployStatus {
    Initialized,
    Deploying,
    Deployed,
    RolledBack,
}

/// Pointer to the last decisive deployment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub status: DeployStatus,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: Option<String>,
    pub version: String,
}

impl CurrentState {
    pub fn new(status: DeployStatus, transaction_id: Option<&str>, version: &str) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            transaction_id: transaction_id.map(str::to_string),
            version: version.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}
