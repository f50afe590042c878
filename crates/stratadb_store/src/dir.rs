//! Store directory management.
//!
//! File system layout for a persistent store:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ wal.log           # Write-ahead log
//! └─ snapshot.dat      # Checkpoint snapshot (full state at a sequence)
//! ```
//!
//! The LOCK file ensures only one process can open the store at a time.
//! Checkpoint snapshots are replaced atomically via a temp file + rename.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const SNAPSHOT_FILE: &str = "snapshot.dat";
const SNAPSHOT_TEMP: &str = "snapshot.tmp";

/// Manages the store directory structure and the exclusive process lock.
///
/// Only one `StoreDir` instance can exist per directory at a time; a second
/// open attempt fails with [`StoreError::Locked`].
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory, acquiring the exclusive lock.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(StoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the write-ahead log path.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the checkpoint snapshot path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Atomically replaces the checkpoint snapshot with `data`.
    pub fn replace_snapshot(&self, data: &[u8]) -> StoreResult<()> {
        let temp = self.path.join(SNAPSHOT_TEMP);
        fs::write(&temp, data)?;
        let file = File::open(&temp)?;
        file.sync_all()?;
        fs::rename(&temp, self.snapshot_path())?;
        Ok(())
    }

    /// Reads the checkpoint snapshot, if one exists.
    pub fn read_snapshot(&self) -> StoreResult<Option<Vec<u8>>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn open_missing_without_create_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing");
        assert!(StoreDir::open(&path, false).is_err());
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let _first = StoreDir::open(&path, true).unwrap();
        assert!(matches!(
            StoreDir::open(&path, true),
            Err(StoreError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        {
            let _dir = StoreDir::open(&path, true).unwrap();
        }
        assert!(StoreDir::open(&path, true).is_ok());
    }

    #[test]
    fn snapshot_roundtrip() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(&temp.path().join("db"), true).unwrap();
        assert!(dir.read_snapshot().unwrap().is_none());
        dir.replace_snapshot(b"state").unwrap();
        assert_eq!(dir.read_snapshot().unwrap().unwrap(), b"state");
        dir.replace_snapshot(b"newer").unwrap();
        assert_eq!(dir.read_snapshot().unwrap().unwrap(), b"newer");
    }
}
