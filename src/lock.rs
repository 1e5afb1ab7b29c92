//! Exclusive PID lock files.
//!
//! A lock is a file holding the owner's PID, additionally guarded by an
//! advisory `flock` for as long as the owner holds the [`PidLock`]. A recorded
//! PID that is no longer alive is stale and is reclaimed silently.
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, info};

use crate::{
    error::{OpsError, Result},
    process::is_alive,
};

/// A held lock. Released (and the file removed) on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: Option<File>,
    pid: u32,
}

impl PidLock {
    /// Acquires the lock at `path` for the current process.
    ///
    /// Fails fast with [`OpsError::LockContention`] when a live process owns the
    /// lock; never waits or queues.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_for(path, std::process::id())
    }

    /// Acquires the lock recording `pid` as owner.
    pub fn acquire_for(path: &Path, pid: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // A releasing owner unlinks the file; if that happens between our open
        // and our flock we hold a lock on a dead inode, so reopen and retry.
        for _ in 0..3 {
            if let Some(lock) = Self::try_acquire(path, pid)? {
                return Ok(lock);
            }
        }

        Err(OpsError::LockContention {
            path: path.to_path_buf(),
            pid: 0,
        })
    }

    fn try_acquire(path: &Path, pid: u32) -> Result<Option<Self>> {
        // Do not truncate before holding the flock: that would wipe a live
        // owner's PID.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let recorded = read_owner(&mut file);

        if file.try_lock_exclusive().is_err() {
            return Err(OpsError::LockContention {
                path: path.to_path_buf(),
                pid: recorded.unwrap_or(0),
            });
        }

        let same_inode = fs::metadata(path)
            .map(|meta| meta.ino() == file.metadata().map(|m| m.ino()).unwrap_or(0))
            .unwrap_or(false);
        if !same_inode {
            let _ = FileExt::unlock(&file);
            return Ok(None);
        }

        let recorded = read_owner(&mut file).or(recorded);

        // The flock only protects against other clawops processes; a live PID
        // recorded by any other writer still owns the lock.
        if let Some(owner) = recorded
            && owner != pid
            && is_alive(owner)
        {
            let _ = FileExt::unlock(&file);
            return Err(OpsError::LockContention {
                path: path.to_path_buf(),
                pid: owner,
            });
        }

        if let Some(owner) = recorded
            && owner != pid
        {
            info!("Reclaiming stale lock {} from dead PID {owner}", path.display());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;
        debug!("Acquired lock {} for PID {pid}", path.display());

        Ok(Some(Self {
            path: path.to_path_buf(),
            file: Some(file),
            pid,
        }))
    }

    /// Returns the live owner of the lock at `path`, if any.
    pub fn owner(path: &Path) -> Option<u32> {
        let mut file = File::open(path).ok()?;
        read_owner(&mut file).filter(|pid| is_alive(*pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Releases the lock and removes the file.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs::remove_file(&self.path);
            let _ = FileExt::unlock(&file);
            debug!("Released lock {}", self.path.display());
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn read_owner(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_acquire_is_contention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clawops.lock");

        let first = PidLock::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), first.pid().to_string());

        let err = PidLock::acquire(&path).unwrap_err();
        match err {
            OpsError::LockContention { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("expected contention, got {other:?}"),
        }

        drop(first);
        assert!(!path.exists(), "lock file removed on release");
        PidLock::acquire(&path).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clawops.lock");

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{dead_pid}\n")).unwrap();

        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock.pid(), std::process::id());
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn live_foreign_owner_without_flock_still_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clawops.lock");

        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        fs::write(&path, format!("{}\n", child.id())).unwrap();

        let err = PidLock::acquire(&path).unwrap_err();
        assert!(matches!(err, OpsError::LockContention { pid, .. } if pid == child.id()));
        assert_eq!(PidLock::owner(&path), Some(child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(PidLock::owner(&path), None);
    }
}
