use crate::error::{Result, StageError};
use crate::types::StageType;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STAGECRAFT_DIR: &str = ".stagecraft";
pub const PROJECTS_DIR: &str = ".stagecraft/projects";
pub const CONFIG_FILE: &str = ".stagecraft/config.yaml";

pub const PROJECT_FILE: &str = "project.yaml";
pub const STAGES_DIR: &str = "stages";
pub const HISTORY_DIR: &str = "history";
pub const PENDING_DIR: &str = "pending";
pub const VERSIONS_DIR: &str = ".versions";
pub const VERSION_LOG: &str = "log.jsonl";
pub const LOCK_FILE: &str = ".lock";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn stagecraft_dir(root: &Path) -> PathBuf {
    root.join(STAGECRAFT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn projects_dir(root: &Path) -> PathBuf {
    root.join(PROJECTS_DIR)
}

pub fn project_dir(root: &Path, project: &str) -> PathBuf {
    projects_dir(root).join(project)
}

pub fn project_manifest(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join(PROJECT_FILE)
}

pub fn stages_dir(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join(STAGES_DIR)
}

pub fn stage_path(root: &Path, project: &str, stage: StageType) -> PathBuf {
    stages_dir(root, project).join(stage.filename())
}

pub fn history_dir(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join(HISTORY_DIR)
}

pub fn history_path(root: &Path, project: &str, stage: StageType) -> PathBuf {
    history_dir(root, project).join(stage.history_filename())
}

pub fn pending_path(root: &Path, project: &str, stage: StageType) -> PathBuf {
    project_dir(root, project).join(PENDING_DIR).join(stage.filename())
}

pub fn versions_dir(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join(VERSIONS_DIR)
}

pub fn version_log(root: &Path, project: &str) -> PathBuf {
    versions_dir(root, project).join(VERSION_LOG)
}

pub fn lock_path(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join(LOCK_FILE)
}

// ---------------------------------------------------------------------------
// Slug validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 64 || !slug_re().is_match(slug) {
        return Err(StageError::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
