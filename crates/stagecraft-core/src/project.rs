use crate::error::{Result, StageError};
use crate::graph::DependencyGraph;
use crate::paths;
use crate::store::ArtifactStore;
use crate::types::{StageStatus, StageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Planned number of chapters. Raising it grows the dependency graph;
    /// stored chapters beyond it still take part in cascades.
    pub chapters: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of a project's stage overview.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: StageType,
    pub status: StageStatus,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(name: impl Into<String>, chapters: u32) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            title: None,
            chapters,
            created_at: now,
            updated_at: now,
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    pub fn create(
        root: &Path,
        name: impl Into<String>,
        title: Option<String>,
        chapters: u32,
    ) -> Result<Self> {
        let name = name.into();
        paths::validate_slug(&name)?;

        if paths::project_manifest(root, &name).exists() {
            return Err(StageError::ProjectExists(name));
        }

        let mut project = Self::new(name, chapters);
        project.title = title;
        crate::io::ensure_dir(&paths::stages_dir(root, &project.name))?;
        crate::io::ensure_dir(&paths::history_dir(root, &project.name))?;
        project.save(root)?;
        tracing::info!(project = %project.name, chapters, "project created");
        Ok(project)
    }

    pub fn load(root: &Path, name: &str) -> Result<Self> {
        paths::validate_slug(name)?;
        let manifest = paths::project_manifest(root, name);
        if !manifest.exists() {
            return Err(StageError::ProjectNotFound(name.to_string()));
        }
        let data = std::fs::read_to_string(&manifest)?;
        let project: Project = serde_yaml::from_str(&data)?;
        Ok(project)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let manifest = paths::project_manifest(root, &self.name);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&manifest, data.as_bytes())
    }

    pub fn list(root: &Path) -> Result<Vec<Self>> {
        let dir = paths::projects_dir(root);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if paths::validate_slug(&name).is_err() {
                    continue;
                }
                match Self::load(root, &name) {
                    Ok(p) => projects.push(p),
                    Err(StageError::ProjectNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    /// Remove the project and everything it owns, version history included.
    pub fn delete(root: &Path, name: &str) -> Result<()> {
        paths::validate_slug(name)?;
        let dir = paths::project_dir(root, name);
        if !paths::project_manifest(root, name).exists() {
            return Err(StageError::ProjectNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(project = name, "project deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------------

    pub fn set_chapters(&mut self, chapters: u32) {
        self.chapters = chapters;
        self.updated_at = Utc::now();
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
        self.updated_at = Utc::now();
    }

    // ---------------------------------------------------------------------------
    // Graph helpers
    // ---------------------------------------------------------------------------

    /// Dependency graph covering the planned chapters and every stored stage.
    pub fn graph_for(&self, stored: &BTreeSet<StageType>) -> DependencyGraph {
        let highest = stored
            .iter()
            .copied()
            .filter_map(StageType::index)
            .map(|i| i + 1)
            .max()
            .unwrap_or(0);
        DependencyGraph::new(self.chapters.max(highest))
    }

    /// Status overview of every stage in the graph, in pipeline order.
    pub fn overview(&self, store: &dyn ArtifactStore) -> Result<Vec<StageSummary>> {
        let stored = store.list(&self.name)?;
        let graph = self.graph_for(&stored);
        let mut rows = Vec::new();
        for stage in graph.stages() {
            let row = if stored.contains(&stage) {
                let s = store.read(&self.name, stage)?;
                StageSummary {
                    stage,
                    status: s.status,
                    version: s.version,
                    updated_at: Some(s.updated_at),
                }
            } else {
                StageSummary {
                    stage,
                    status: StageStatus::Missing,
                    version: 0,
                    updated_at: None,
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
