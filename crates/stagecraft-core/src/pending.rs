use crate::collaborator::Verdict;
use crate::error::Result;
use crate::io;
use crate::paths;
use crate::types::StageType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A candidate the judge never approved, parked until a human accepts or
/// abandons it. Nothing about it has been applied to the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRevision {
    pub project: String,
    pub stage: StageType,
    pub content: String,
    pub feedback: String,
    pub attempts: u32,
    pub verdict: Verdict,
    /// Stage version the candidate was generated against (0 if missing).
    pub base_version: u64,
    /// Versions of the dependencies whose content went into the context.
    #[serde(default)]
    pub dependency_versions: BTreeMap<StageType, u64>,
    pub created_at: DateTime<Utc>,
}

/// At most one pending revision per stage; a newer one replaces the older.
#[derive(Debug, Clone)]
pub struct PendingStore {
    root: PathBuf,
}

impl PendingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn save(&self, pending: &PendingRevision) -> Result<()> {
        let path = paths::pending_path(&self.root, &pending.project, pending.stage);
        let data = serde_yaml::to_string(pending)?;
        io::atomic_write(&path, data.as_bytes())
    }

    pub fn load(&self, project: &str, stage: StageType) -> Result<Option<PendingRevision>> {
        let path = paths::pending_path(&self.root, project, stage);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    /// Returns `true` if a pending revision existed.
    pub fn remove(&self, project: &str, stage: StageType) -> Result<bool> {
        io::remove_if_exists(&paths::pending_path(&self.root, project, stage))
    }

    /// Drop every pending revision of a project.
    pub fn clear(&self, project: &str) -> Result<()> {
        let dir = paths::project_dir(&self.root, project).join(paths::PENDING_DIR);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pending(stage: StageType) -> PendingRevision {
        PendingRevision {
            project: "novel".into(),
            stage,
            content: "candidate".into(),
            feedback: "make it epic".into(),
            attempts: 3,
            verdict: Verdict::reject("still small", vec!["no war".into()]),
            base_version: 2,
            dependency_versions: [(StageType::Premise, 4)].into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_remove() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path());
        assert!(store.load("novel", StageType::Treatment).unwrap().is_none());

        store.save(&pending(StageType::Treatment)).unwrap();
        let loaded = store.load("novel", StageType::Treatment).unwrap().unwrap();
        assert_eq!(loaded.attempts, 3);
        assert_eq!(loaded.verdict.issues, vec!["no war".to_string()]);
        assert_eq!(loaded.dependency_versions[&StageType::Premise], 4);

        assert!(store.remove("novel", StageType::Treatment).unwrap());
        assert!(!store.remove("novel", StageType::Treatment).unwrap());
    }

    #[test]
    fn clear_drops_all_stages() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path());
        store.clear("novel").unwrap();

        store.save(&pending(StageType::Premise)).unwrap();
        store.save(&pending(StageType::Prose(0))).unwrap();
        store.clear("novel").unwrap();
        assert!(store.load("novel", StageType::Premise).unwrap().is_none());
        assert!(store.load("novel", StageType::Prose(0)).unwrap().is_none());
    }
}
