use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// StageType
// ---------------------------------------------------------------------------

/// One node of the generation pipeline.
///
/// The derived ordering is the pipeline's total order:
/// `Premise < Treatment < StructurePlan < ChapterPlan(*) < Prose(*)`, with
/// indexed variants ordered by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StageType {
    Premise,
    Treatment,
    StructurePlan,
    ChapterPlan(u32),
    Prose(u32),
}

impl StageType {
    /// The fixed, non-indexed head of the pipeline.
    pub fn head() -> &'static [StageType] {
        &[
            StageType::Premise,
            StageType::Treatment,
            StageType::StructurePlan,
        ]
    }

    pub fn kind(self) -> &'static str {
        match self {
            StageType::Premise => "premise",
            StageType::Treatment => "treatment",
            StageType::StructurePlan => "structure_plan",
            StageType::ChapterPlan(_) => "chapter_plan",
            StageType::Prose(_) => "prose",
        }
    }

    pub fn index(self) -> Option<u32> {
        match self {
            StageType::ChapterPlan(i) | StageType::Prose(i) => Some(i),
            _ => None,
        }
    }

    /// Stable textual key, also used as the on-disk file stem.
    pub fn key(self) -> String {
        match self.index() {
            Some(i) => format!("{}.{}", self.kind(), i),
            None => self.kind().to_string(),
        }
    }

    pub fn filename(self) -> String {
        format!("{}.yaml", self.key())
    }

    pub fn history_filename(self) -> String {
        format!("{}.jsonl", self.key())
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl std::str::FromStr for StageType {
    type Err = crate::error::StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_").replace(':', ".");
        let invalid = || crate::error::StageError::InvalidStage(s.to_string());

        let (kind, index) = match normalized.split_once('.') {
            Some((kind, idx)) => (kind, Some(idx.parse::<u32>().map_err(|_| invalid())?)),
            None => (normalized.as_str(), None),
        };

        match (kind, index) {
            ("premise", None) => Ok(StageType::Premise),
            ("treatment", None) => Ok(StageType::Treatment),
            ("structure_plan" | "structure", None) => Ok(StageType::StructurePlan),
            ("chapter_plan" | "chapter", Some(i)) => Ok(StageType::ChapterPlan(i)),
            ("prose", Some(i)) => Ok(StageType::Prose(i)),
            _ => Err(invalid()),
        }
    }
}

impl From<StageType> for String {
    fn from(stage: StageType) -> Self {
        stage.key()
    }
}

impl TryFrom<String> for StageType {
    type Error = crate::error::StageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Missing,
    Draft,
    Approved,
    Stale,
}

impl StageStatus {
    /// Whether a stage in this status may be used as upstream context.
    pub fn is_usable(self) -> bool {
        matches!(self, StageStatus::Draft | StageStatus::Approved)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Missing => "missing",
            StageStatus::Draft => "draft",
            StageStatus::Approved => "approved",
            StageStatus::Stale => "stale",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

/// What happens to downstream stages when an upstream stage is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    /// Delete every cascaded stage together with its iteration history.
    #[default]
    CullAll,
    /// Keep cascaded stages on disk but mark them stale.
    KeepAll,
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidation::CullAll => f.write_str("cull_all"),
            Invalidation::KeepAll => f.write_str("keep_all"),
        }
    }
}

impl std::str::FromStr for Invalidation {
    type Err = crate::error::StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cull_all" | "cull-all" | "cull" => Ok(Invalidation::CullAll),
            "keep_all" | "keep-all" | "keep" => Ok(Invalidation::KeepAll),
            _ => Err(crate::error::StageError::InvalidStage(format!(
                "unknown invalidation policy: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
