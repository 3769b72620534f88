//! Cross-process single-flight lock around a sync cycle.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use syllabus_core::paths;

use crate::error::{io_err, SyncError};

/// Exclusive advisory lock on `.syllabus/sync.lock`, released on drop.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    file: File,
}

impl SyncLock {
    /// Take the lock without waiting. Fails with [`SyncError::Locked`] when
    /// another cycle (in this or any other process) holds it.
    pub fn acquire(root: &Path) -> Result<Self, SyncError> {
        let path = paths::lock_path(root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(SyncError::Locked { path });
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
