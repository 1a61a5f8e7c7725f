//! Version control over a project's stages and iteration histories.
//!
//! A commit captures `stages/` and `history/` as they are on disk. Reverting
//! restores both directories from a prior commit and records the revert as a
//! new commit, so the version log itself is append-only.

use crate::error::{Result, StageError};
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type VersionId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: VersionId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub trait VersionedCommitter: Send + Sync {
    /// Record the project's current stages and histories as a new version.
    fn commit(&self, project: &str, message: &str) -> Result<VersionId>;

    /// Restore every stage and history to the snapshot taken at `version`.
    fn revert(&self, project: &str, version: &str) -> Result<()>;

    /// All versions, oldest first.
    fn history(&self, project: &str) -> Result<Vec<VersionEntry>>;
}

// ---------------------------------------------------------------------------
// SnapshotCommitter
// ---------------------------------------------------------------------------

/// Directory-snapshot version control under `<project>/.versions/`.
///
/// Each version is a full copy of `stages/` and `history/` in
/// `.versions/<id>/`; `.versions/log.jsonl` lists them in order. A snapshot is
/// assembled in a scratch directory and renamed into place before the log
/// line is appended, so the log never names a partial snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotCommitter {
    root: PathBuf,
}

impl SnapshotCommitter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn snapshot_dir(&self, project: &str, id: &str) -> PathBuf {
        paths::versions_dir(&self.root, project).join(id)
    }
}

impl VersionedCommitter for SnapshotCommitter {
    fn commit(&self, project: &str, message: &str) -> Result<VersionId> {
        let project_dir = paths::project_dir(&self.root, project);
        if !project_dir.is_dir() {
            return Err(StageError::ProjectNotFound(project.to_string()));
        }

        let id = next_id(&self.history(project)?);

        let versions = paths::versions_dir(&self.root, project);
        let scratch = versions.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        io::copy_dir(&project_dir.join(paths::STAGES_DIR), &scratch.join(paths::STAGES_DIR))?;
        io::copy_dir(&project_dir.join(paths::HISTORY_DIR), &scratch.join(paths::HISTORY_DIR))?;
        io::ensure_dir(&scratch)?;

        let target = self.snapshot_dir(project, &id);
        // Left behind by a crash between rename and log append.
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&scratch, &target)?;

        let entry = VersionEntry {
            id: id.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        io::append_line(
            &paths::version_log(&self.root, project),
            &serde_json::to_string(&entry)?,
        )?;
        tracing::info!(project, version = %id, "committed");
        Ok(id)
    }

    fn revert(&self, project: &str, version: &str) -> Result<()> {
        if !self.history(project)?.iter().any(|e| e.id == version) {
            return Err(StageError::VersionNotFound(version.to_string()));
        }
        let snapshot = self.snapshot_dir(project, version);
        let project_dir = paths::project_dir(&self.root, project);
        io::replace_dir(
            &snapshot.join(paths::STAGES_DIR),
            &project_dir.join(paths::STAGES_DIR),
        )?;
        io::replace_dir(
            &snapshot.join(paths::HISTORY_DIR),
            &project_dir.join(paths::HISTORY_DIR),
        )?;
        self.commit(project, &format!("revert to {version}"))?;
        tracing::info!(project, version, "reverted");
        Ok(())
    }

    fn history(&self, project: &str) -> Result<Vec<VersionEntry>> {
        read_log(&paths::version_log(&self.root, project))
    }
}

/// One past the highest id in the log. An unreadable line never lowers it;
/// a snapshot directory the log does not name is an orphan and is reused.
fn next_id(existing: &[VersionEntry]) -> VersionId {
    let highest = existing
        .iter()
        .filter_map(|e| e.id.strip_prefix('v')?.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("v{:04}", highest + 1)
}

fn read_log(path: &Path) -> Result<Vec<VersionEntry>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<VersionEntry>(line) {
            Ok(e) => entries.push(e),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable version log line"),
        }
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
