//! `git`-backed [`VersionedCommitter`]: one repository per project directory.

use crate::committer::{VersionEntry, VersionId, VersionedCommitter};
use crate::error::{Result, StageError};
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;

const GITIGNORE: &str = "pending/\n.lock\n.versions/\n";

#[derive(Debug, Clone)]
pub struct GitCommitter {
    root: PathBuf,
    git: PathBuf,
}

impl GitCommitter {
    /// Locate `git` on `PATH`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let git = which::which("git")
            .map_err(|e| StageError::Commit(format!("git not found on PATH: {e}")))?;
        Ok(Self {
            root: root.into(),
            git,
        })
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(dir)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::Commit(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn succeeds(&self, dir: &Path, args: &[&str]) -> bool {
        Command::new(&self.git)
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Initialize the project's repository on first use.
    fn ensure_repo(&self, project: &str) -> Result<PathBuf> {
        let dir = paths::project_dir(&self.root, project);
        if !paths::project_manifest(&self.root, project).exists() {
            return Err(StageError::ProjectNotFound(project.to_string()));
        }
        if !dir.join(".git").exists() {
            self.run(&dir, &["init", "--quiet"])?;
            io::atomic_write(&dir.join(".gitignore"), GITIGNORE.as_bytes())?;
        }
        if !self.succeeds(&dir, &["config", "user.email"]) {
            self.run(&dir, &["config", "user.name", "stagecraft"])?;
            self.run(&dir, &["config", "user.email", "stagecraft@localhost"])?;
        }
        Ok(dir)
    }

    fn has_commits(&self, dir: &Path) -> bool {
        self.succeeds(dir, &["rev-parse", "--verify", "--quiet", "HEAD"])
    }
}

impl VersionedCommitter for GitCommitter {
    fn commit(&self, project: &str, message: &str) -> Result<VersionId> {
        let dir = self.ensure_repo(project)?;
        self.run(&dir, &["add", "-A", "."])?;
        self.run(&dir, &["commit", "--quiet", "--allow-empty", "-m", message])?;
        let id = self.run(&dir, &["rev-parse", "HEAD"])?;
        tracing::info!(project, version = %id, "committed");
        Ok(id)
    }

    fn revert(&self, project: &str, version: &str) -> Result<()> {
        let dir = self.ensure_repo(project)?;
        let spec = format!("{version}^{{commit}}");
        if !self.succeeds(&dir, &["cat-file", "-e", &spec]) {
            return Err(StageError::VersionNotFound(version.to_string()));
        }

        // Files created after `version` must disappear, so clear both trees
        // before checking the old ones out.
        for sub in [paths::STAGES_DIR, paths::HISTORY_DIR] {
            let path = dir.join(sub);
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
        }
        self.run(&dir, &["checkout", version, "--", "."])?;
        io::ensure_dir(&dir.join(paths::STAGES_DIR))?;
        io::ensure_dir(&dir.join(paths::HISTORY_DIR))?;

        self.commit(project, &format!("revert to {version}"))?;
        tracing::info!(project, version, "reverted");
        Ok(())
    }

    fn history(&self, project: &str) -> Result<Vec<VersionEntry>> {
        let dir = paths::project_dir(&self.root, project);
        if !dir.join(".git").exists() || !self.has_commits(&dir) {
            return Ok(Vec::new());
        }
        let log = self.run(&dir, &["log", "--reverse", "--format=%H%x1f%cI%x1f%s"])?;
        let mut entries = Vec::new();
        for line in log.lines() {
            let mut parts = line.splitn(3, '\u{1f}');
            let (Some(id), Some(ts), Some(msg)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(ts)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            entries.push(VersionEntry {
                id: id.to_string(),
                message: msg.to_string(),
                timestamp,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use crate::store::{ArtifactStore, FsArtifactStore};
    use crate::types::StageType;
    use tempfile::TempDir;

    #[test]
    fn git_commit_and_revert() {
        let Ok(_) = which::which("git") else {
            eprintln!("git not installed; skipping");
            return;
        };
        let dir = TempDir::new().unwrap();
        Project::create(dir.path(), "novel", None, 1).unwrap();
        let store = FsArtifactStore::new(dir.path());
        let committer = GitCommitter::new(dir.path()).unwrap();

        assert!(committer.history("novel").unwrap().is_empty());

        store.write("novel", StageType::Premise, "first").unwrap();
        let v1 = committer.commit("novel", "premise v1").unwrap();
        store.write("novel", StageType::Premise, "second").unwrap();
        store.write("novel", StageType::Treatment, "t").unwrap();
        committer.commit("novel", "premise v2").unwrap();

        committer.revert("novel", &v1).unwrap();
        assert_eq!(
            store.read("novel", StageType::Premise).unwrap().content,
            "first"
        );
        assert!(!store.list("novel").unwrap().contains(&StageType::Treatment));

        let log = committer.history("novel").unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].message, "premise v1");
        assert_eq!(log[2].message, format!("revert to {v1}"));
    }
}
