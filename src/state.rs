// src/state.rs

//! Cycle state persisted between runs, plus the single-instance lock.
//!
//! The store is one JSON file holding the last processed commit and the
//! missing-dependency memory of failed packages. Saves are atomic (write to a
//! temp file in the same directory, then rename). The lock is held for the
//! whole cycle so only one scheduler runs per repository.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Memory of one failed package, kept across cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Internal dependencies that were missing at the failed attempt
    #[serde(default)]
    pub missing: Vec<String>,
    /// Upstream version the failed attempt was building towards
    #[serde(default)]
    pub version: Option<String>,
}

/// State carried from one cycle to the next
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStore {
    /// Repository HEAD after the last completed cycle (40-hex)
    #[serde(default)]
    pub last_commit: Option<String>,

    /// Packages whose last attempt failed, keyed by pkgbase
    #[serde(default)]
    pub failed: HashMap<String, FailedRecord>,
}

impl CycleStore {
    /// Load the store; a missing file yields empty defaults
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save atomically: write a temp file next to the target, then rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        debug!("cycle store saved to {}", path.display());
        Ok(())
    }
}

/// Process-wide exclusive lock on the working directory.
///
/// Held (via `flock`) for the lifetime of the value; dropping releases it.
pub struct LockFile {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquire without blocking; a held lock aborts the cycle
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired lock at {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(Error::LockHeld(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = CycleStore::load(&dir.path().join("store")).unwrap();
        assert!(store.last_commit.is_none());
        assert!(store.failed.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        let mut store = CycleStore::default();
        store.last_commit = Some("0123456789abcdef0123456789abcdef01234567".to_string());
        store.failed.insert(
            "pkga".to_string(),
            FailedRecord {
                missing: vec!["pkgb".to_string()],
                version: Some("2.0".to_string()),
            },
        );
        store.save(&path).unwrap();

        let reloaded = CycleStore::load(&path).unwrap();
        assert_eq!(reloaded.last_commit, store.last_commit);
        assert_eq!(reloaded.failed.get("pkga").unwrap().missing, vec!["pkgb"]);
        assert_eq!(
            reloaded.failed.get("pkga").unwrap().version.as_deref(),
            Some("2.0")
        );
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let lock = LockFile::acquire(&path).unwrap();
        match LockFile::acquire(&path) {
            Err(Error::LockHeld(p)) => assert_eq!(p, path),
            other => panic!("expected LockHeld, got {:?}", other.map(|l| l.path().to_path_buf())),
        }

        drop(lock);
        assert!(LockFile::acquire(&path).is_ok());
    }
}
