//! Disposable working copies of a source file.
//!
//! [`ScratchWorkspace`] holds a byte-for-byte copy of the original in a
//! unique temporary directory. [`InPlaceStage`] temporarily puts patched
//! content at the canonical path behind a backup. Both are guards: dropping
//! them without an explicit release still cleans up, so every exit path
//! (early return, `?`, panic unwinding) leaves the original intact.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::patch::write_atomic;

/// Suffix appended to the canonical path while content is staged in place.
pub const BACKUP_SUFFIX: &str = ".mend.bak";

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("stale backup exists at {0}; restore or remove it before retrying")]
    StaleBackup(PathBuf),
}

pub type Result<T> = std::result::Result<T, ScratchError>;

/// An isolated copy of one file, removed on release or drop.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: Option<TempDir>,
    working_path: PathBuf,
    original_path: PathBuf,
}

impl ScratchWorkspace {
    /// Copy `original_path` into a fresh uniquely named temp directory.
    ///
    /// The copy keeps the original's file name so tools that care about the
    /// extension or module name still work against it.
    pub fn acquire(original_path: &Path) -> Result<Self> {
        if !original_path.is_file() {
            return Err(ScratchError::NotAFile(original_path.to_path_buf()));
        }

        let dir = tempfile::Builder::new().prefix("mend-").tempdir()?;
        let file_name = original_path
            .file_name()
            .map_or_else(|| "working".into(), std::ffi::OsStr::to_os_string);
        let working_path = dir.path().join(file_name);
        fs::copy(original_path, &working_path)?;

        debug!(
            original = %original_path.display(),
            working = %working_path.display(),
            "acquired scratch workspace"
        );

        Ok(Self {
            dir: Some(dir),
            working_path,
            original_path: original_path.to_path_buf(),
        })
    }

    /// Path of the working copy.
    pub fn path(&self) -> &Path {
        &self.working_path
    }

    /// Canonical path the copy was taken from.
    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    /// Current bytes of the working copy.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.working_path)?)
    }

    /// Replace the working copy's content atomically.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.working_path, bytes)?;
        Ok(())
    }

    /// Remove the temp directory, surfacing any removal error.
    pub fn release(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            dir.close()?;
            debug!(working = %self.working_path.display(), "released scratch workspace");
        }
        Ok(())
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                warn!(
                    working = %self.working_path.display(),
                    error = %err,
                    "failed to remove scratch workspace"
                );
            }
        }
    }
}

/// Patched content staged at the canonical path, restored on release or drop.
#[derive(Debug)]
pub struct InPlaceStage {
    original_path: PathBuf,
    backup_path: PathBuf,
    restored: bool,
}

impl InPlaceStage {
    /// Backup location used for `original_path`.
    pub fn backup_path_for(original_path: &Path) -> PathBuf {
        let mut backup = original_path.as_os_str().to_os_string();
        backup.push(BACKUP_SUFFIX);
        PathBuf::from(backup)
    }

    /// Back up the original, then overwrite it with `patched`.
    ///
    /// Refuses when a backup already exists: it may be the only good copy
    /// left behind by an interrupted session.
    pub fn stage(original_path: &Path, patched: &[u8]) -> Result<Self> {
        if !original_path.is_file() {
            return Err(ScratchError::NotAFile(original_path.to_path_buf()));
        }
        let backup_path = Self::backup_path_for(original_path);
        if backup_path.exists() {
            return Err(ScratchError::StaleBackup(backup_path));
        }

        fs::copy(original_path, &backup_path)?;
        let mut stage = Self {
            original_path: original_path.to_path_buf(),
            backup_path,
            restored: false,
        };

        if let Err(err) = write_atomic(original_path, patched) {
            return Err(stage.abandon(err));
        }

        debug!(
            original = %stage.original_path.display(),
            backup = %stage.backup_path.display(),
            "staged patched content in place"
        );
        Ok(stage)
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Undo a stage whose write failed, keeping `cause` as the reported error.
    ///
    /// Nothing was renamed over the original, but the backup still goes back
    /// through the normal path so no stale file is left behind.
    fn abandon(mut self, cause: io::Error) -> ScratchError {
        if let Err(err) = self.restore_inner() {
            error!(
                original = %self.original_path.display(),
                backup = %self.backup_path.display(),
                error = %err,
                "failed to remove backup after staging failed"
            );
        }
        ScratchError::Io(cause)
    }

    /// Move the backup back over the original.
    pub fn restore(mut self) -> Result<()> {
        self.restore_inner()?;
        Ok(())
    }

    fn restore_inner(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        fs::rename(&self.backup_path, &self.original_path)?;
        self.restored = true;
        debug!(original = %self.original_path.display(), "restored original from backup");
        Ok(())
    }
}

impl Drop for InPlaceStage {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            error!(
                original = %self.original_path.display(),
                backup = %self.backup_path.display(),
                error = %err,
                "failed to restore original from backup"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_stage_reports_the_write_error() {
        let dir = TempDir::new().unwrap();
        let stage = InPlaceStage {
            original_path: dir.path().join("calc.py"),
            backup_path: dir.path().join("missing.mend.bak"),
            restored: false,
        };
        let err = stage.abandon(io::Error::other("disk full"));
        match err {
            ScratchError::Io(cause) => assert_eq!(cause.to_string(), "disk full"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn original(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("calc.py");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn acquire_copies_bytes_to_unique_path() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "def add(a,b):\n    return a-b\n");

        let first = ScratchWorkspace::acquire(&path).unwrap();
        let second = ScratchWorkspace::acquire(&path).unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(first.read().unwrap(), fs::read(&path).unwrap());
        assert_eq!(first.path().file_name().unwrap(), "calc.py");
    }

    #[test]
    fn writes_never_touch_the_original() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "before\n");

        let ws = ScratchWorkspace::acquire(&path).unwrap();
        ws.write(b"after\n").unwrap();
        assert_eq!(ws.read().unwrap(), b"after\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "before\n");
    }

    #[test]
    fn release_and_drop_remove_the_copy() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "x\n");

        let released = ScratchWorkspace::acquire(&path).unwrap();
        let released_path = released.path().to_path_buf();
        released.release().unwrap();
        assert!(!released_path.exists());

        let dropped_path = {
            let ws = ScratchWorkspace::acquire(&path).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!dropped_path.exists());
    }

    #[test]
    fn acquire_rejects_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ScratchWorkspace::acquire(&dir.path().join("missing.py")).unwrap_err();
        assert!(matches!(err, ScratchError::NotAFile(_)));
    }

    #[test]
    fn stage_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "original\n");

        let stage = InPlaceStage::stage(&path, b"patched\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "patched\n");
        assert_eq!(fs::read_to_string(stage.backup_path()).unwrap(), "original\n");

        let backup = stage.backup_path().to_path_buf();
        stage.restore().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "original\n");
        assert!(!backup.exists());
    }

    #[test]
    fn stage_restores_on_panic() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "original\n");

        let staged_path = path.clone();
        let result = std::panic::catch_unwind(move || {
            let _stage = InPlaceStage::stage(&staged_path, b"patched\n").unwrap();
            panic!("test runner blew up");
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "original\n");
        assert!(!InPlaceStage::backup_path_for(&path).exists());
    }

    #[test]
    fn stage_refuses_stale_backup() {
        let dir = TempDir::new().unwrap();
        let path = original(&dir, "current\n");
        let backup = InPlaceStage::backup_path_for(&path);
        fs::write(&backup, "older good copy\n").unwrap();

        let err = InPlaceStage::stage(&path, b"patched\n").unwrap_err();
        assert!(matches!(err, ScratchError::StaleBackup(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "current\n");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "older good copy\n");
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            InPlaceStage::backup_path_for(Path::new("/src/calc.py")),
            PathBuf::from("/src/calc.py.mend.bak")
        );
    }
}
