//! Per-transaction snapshots of deployment artifacts.
//!
//! Layout of `<backups>/<tx_id>/`:
//! - `project/<path>`: copies of the configured artifact paths
//! - `runtime/<file>`: PID and health snapshot at backup time
//! - `metadata.json`: [`BackupMetadata`]
use std::{
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    constants::BACKUP_METADATA_FILE_NAME,
    error::{OpsError, Result},
    fsutil::{read_json, write_json_atomic},
    runtime::RuntimeDirectory,
};

const PROJECT_DIR: &str = "project";
const RUNTIME_DIR: &str = "runtime";

/// A file captured in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Path relative to the backup directory.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// A configured artifact path and whether it existed at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRoot {
    pub path: String,
    pub present: bool,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub tx_id: String,
    pub created_at: DateTime<Utc>,
    pub roots: Vec<BackupRoot>,
    pub files: Vec<BackupFile>,
}

/// The backups directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, tx_id: &str) -> PathBuf {
        self.root.join(tx_id)
    }

    /// Whether a complete backup exists for `tx_id`.
    pub fn exists(&self, tx_id: &str) -> bool {
        self.dir(tx_id).join(BACKUP_METADATA_FILE_NAME).is_file()
    }

    pub fn metadata(&self, tx_id: &str) -> Result<BackupMetadata> {
        read_json(&self.dir(tx_id).join(BACKUP_METADATA_FILE_NAME))?
            .ok_or_else(|| OpsError::NoBackup(tx_id.to_string()))
    }

    /// Snapshots `paths` (relative to `project_dir`) plus runtime state files.
    pub fn create(
        &self,
        tx_id: &str,
        project_dir: &Path,
        paths: &[PathBuf],
        runtime: &RuntimeDirectory,
    ) -> Result<BackupMetadata> {
        let dir = self.dir(tx_id);
        fs::create_dir_all(&dir)?;

        let mut roots = Vec::with_capacity(paths.len());
        for relative in paths {
            let source = project_dir.join(relative);
            let present = fs::symlink_metadata(&source).is_ok();
            if present {
                copy_tree(&source, &dir.join(PROJECT_DIR).join(relative))?;
            }
            roots.push(BackupRoot {
                path: relative.to_string_lossy().into_owned(),
                present,
            });
        }

        for state_file in [runtime.pid_file(), runtime.health_state_file()] {
            if let Some(name) = state_file.file_name()
                && state_file.is_file()
            {
                copy_tree(&state_file, &dir.join(RUNTIME_DIR).join(name))?;
            }
        }

        let metadata = BackupMetadata {
            tx_id: tx_id.to_string(),
            created_at: Utc::now(),
            roots,
            files: digest_tree(&dir)?,
        };
        write_json_atomic(&dir.join(BACKUP_METADATA_FILE_NAME), &metadata)?;

        info!(
            "Created backup {tx_id} ({} files) in {}",
            metadata.files.len(),
            dir.display()
        );
        Ok(metadata)
    }

    /// Verifies the backup for `tx_id` and copies its artifacts over
    /// `project_dir`. Paths absent at backup time are removed.
    pub fn restore(&self, tx_id: &str, project_dir: &Path) -> Result<BackupMetadata> {
        if !self.exists(tx_id) {
            return Err(OpsError::NoBackup(tx_id.to_string()));
        }
        let metadata = self.metadata(tx_id)?;
        let dir = self.dir(tx_id);
        self.verify(&dir, &metadata)?;

        for root in &metadata.roots {
            let live = project_dir.join(&root.path);
            remove_path(&live)?;
            if root.present {
                copy_tree(&dir.join(PROJECT_DIR).join(&root.path), &live)?;
            }
            debug!("Restored {}", live.display());
        }

        info!("Restored backup {tx_id} into {}", project_dir.display());
        Ok(metadata)
    }

    fn verify(&self, dir: &Path, metadata: &BackupMetadata) -> Result<()> {
        for file in &metadata.files {
            let actual = sha256_file(&dir.join(&file.path))?;
            if actual != file.sha256 {
                return Err(OpsError::RollbackFailed(format!(
                    "backup {} is corrupt: checksum mismatch for {}",
                    metadata.tx_id, file.path
                )));
            }
        }
        Ok(())
    }

    /// Transaction ids with a complete backup, oldest first.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| self.exists(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Removes all but the `keep` most recent backups. Returns removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let ids = self.list()?;
        let excess = ids.len().saturating_sub(keep);
        let removed: Vec<String> = ids.into_iter().take(excess).collect();

        for tx_id in &removed {
            fs::remove_dir_all(self.dir(tx_id))?;
            info!("Pruned backup {tx_id}");
        }
        Ok(removed)
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Copies a file or directory tree, preserving symlinks as links.
fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = if relative.as_os_str().is_empty() {
            destination.to_path_buf()
        } else {
            destination.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&target);
            symlink(link, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            warn!("Skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}

fn digest_tree(dir: &Path) -> Result<Vec<BackupFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .into_owned();
        if relative == BACKUP_METADATA_FILE_NAME {
            continue;
        }

        files.push(BackupFile {
            sha256: sha256_file(entry.path())?,
            bytes: entry.metadata().map_err(io::Error::other)?.len(),
            path: relative,
        });
    }
    Ok(files)
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
