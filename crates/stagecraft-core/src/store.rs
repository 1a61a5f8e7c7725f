//! Durable storage for stage content, addressed by `(project, stage)`.
//!
//! Each stage lives in its own YAML document under
//! `.stagecraft/projects/<project>/stages/<key>.yaml`. Every write goes through
//! [`crate::io::atomic_write`], so a crash leaves either the previous document
//! or the new one on disk.

use crate::error::{Result, StageError};
use crate::io;
use crate::paths;
use crate::stage::Stage;
use crate::types::{StageStatus, StageType};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub trait ArtifactStore: Send + Sync {
    /// Load a stage, or `StageNotFound` if it was never written (or was deleted).
    fn read(&self, project: &str, stage: StageType) -> Result<Stage>;

    /// Replace a stage's content. Bumps the version by one, refreshes
    /// `updated_at` and resets the status to draft.
    fn write(&self, project: &str, stage: StageType, content: &str) -> Result<Stage>;

    /// Change only the status of an existing stage.
    fn set_status(&self, project: &str, stage: StageType, status: StageStatus) -> Result<Stage>;

    /// Store a stage document exactly as given, version and timestamps
    /// included. Used to put back a state read earlier.
    fn put(&self, project: &str, stage: &Stage) -> Result<()>;

    /// Remove a stage. Deleting a missing stage is not an error.
    fn delete(&self, project: &str, stage: StageType) -> Result<()>;

    /// Every stage currently persisted for the project.
    fn list(&self, project: &str) -> Result<BTreeSet<StageType>>;

    /// Status of a stage, reporting `Missing` for stages never written.
    fn status(&self, project: &str, stage: StageType) -> Result<StageStatus> {
        match self.read(project, stage) {
            Ok(s) => Ok(s.status),
            Err(StageError::StageNotFound { .. }) => Ok(StageStatus::Missing),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read(&self, project: &str, stage: StageType) -> Result<Stage> {
        let path = paths::stage_path(&self.root, project, stage);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageError::StageNotFound {
                    project: project.to_string(),
                    stage,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let parsed: Stage = serde_yaml::from_str(&data)?;
        Ok(parsed)
    }

    fn write(&self, project: &str, stage: StageType, content: &str) -> Result<Stage> {
        let mut current = match self.read(project, stage) {
            Ok(s) => s,
            Err(StageError::StageNotFound { .. }) => Stage::new(stage),
            Err(e) => return Err(e),
        };
        current.rewrite(content);
        self.put(project, &current)?;
        tracing::debug!(project, stage = %stage, version = current.version, "stage written");
        Ok(current)
    }

    fn set_status(&self, project: &str, stage: StageType, status: StageStatus) -> Result<Stage> {
        let mut current = self.read(project, stage)?;
        current.set_status(status);
        self.put(project, &current)?;
        Ok(current)
    }

    fn put(&self, project: &str, stage: &Stage) -> Result<()> {
        let path = paths::stage_path(&self.root, project, stage.stage_type);
        let data = serde_yaml::to_string(stage)?;
        io::atomic_write(&path, data.as_bytes())
    }

    fn delete(&self, project: &str, stage: StageType) -> Result<()> {
        let path = paths::stage_path(&self.root, project, stage);
        if io::remove_if_exists(&path)? {
            tracing::debug!(project, stage = %stage, "stage deleted");
        }
        Ok(())
    }

    fn list(&self, project: &str) -> Result<BTreeSet<StageType>> {
        let dir = paths::stages_dir(&self.root, project);
        let mut stages = BTreeSet::new();
        if !dir.is_dir() {
            return Ok(stages);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".yaml") else {
                continue;
            };
            // Stray files (editor backups, leftover temp files) are ignored.
            if let Ok(stage) = stem.parse::<StageType>() {
                stages.insert(stage);
            }
        }
        Ok(stages)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
