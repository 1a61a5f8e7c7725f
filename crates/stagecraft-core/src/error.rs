use crate::types::{StageStatus, StageType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("not initialized: run 'stagecraft init'")]
    NotInitialized,

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("invalid project name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidSlug(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("stage not found: {project}/{stage}")]
    StageNotFound { project: String, stage: StageType },

    #[error("stage {stage} is outside the {chapters} planned chapter(s) of project '{project}'")]
    UnknownStage {
        project: String,
        stage: StageType,
        chapters: u32,
    },

    #[error("cannot move {stage} from {from} to {to}")]
    InvalidTransition {
        stage: StageType,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("cannot iterate {stage}: dependency {dependency} is {status}")]
    DependencyNotReady {
        stage: StageType,
        dependency: StageType,
        status: StageStatus,
    },

    #[error("dependency {dependency} of {stage} changed while {stage} was being generated")]
    DependencyChanged {
        stage: StageType,
        dependency: StageType,
    },

    #[error("generation failed for {stage} after {attempts} attempt(s): {message}")]
    Generation {
        stage: StageType,
        attempts: u32,
        message: String,
    },

    #[error("judge response could not be parsed: {0}")]
    ValidationParse(String),

    #[error("iteration of {stage} cancelled after {attempts} attempt(s)")]
    Cancelled { stage: StageType, attempts: u32 },

    #[error("no pending revision for {project}/{stage}")]
    NoPending { project: String, stage: StageType },

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("project '{0}' is locked by another process")]
    Locked(String),

    #[error("store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StageError>;
