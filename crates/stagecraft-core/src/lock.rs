use crate::error::{Result, StageError};
use crate::paths;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Exclusive cross-process lock backed by `<project>/.lock`.
/// Automatically released when dropped.
pub struct ProjectLock {
    _file: File,
}

impl ProjectLock {
    /// Try to acquire the project lock (non-blocking).
    /// Returns `Locked` if another process holds it.
    pub fn acquire(root: &Path, project: &str) -> Result<Self> {
        let file = open(root, project)?;
        file.try_lock_exclusive()
            .map_err(|_| StageError::Locked(project.to_string()))?;
        Ok(Self { _file: file })
    }

    /// Block until the project lock is free, then take it.
    pub fn wait(root: &Path, project: &str) -> Result<Self> {
        let file = open(root, project)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn open(root: &Path, project: &str) -> Result<File> {
    let path = paths::lock_path(root, project);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)?;
    Ok(file)
}
