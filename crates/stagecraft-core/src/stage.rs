use crate::types::{StageStatus, StageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted artifact of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_type: StageType,
    pub status: StageStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
    pub content: String,
}

impl Stage {
    pub fn new(stage_type: StageType) -> Self {
        let now = Utc::now();
        Self {
            stage_type,
            status: StageStatus::Missing,
            version: 0,
            created_at: now,
            updated_at: now,
            approved_at: None,
            stale_since: None,
            content: String::new(),
        }
    }

    /// Replace the content: version + 1, status back to draft.
    pub fn rewrite(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.version += 1;
        self.status = StageStatus::Draft;
        self.updated_at = Utc::now();
        self.approved_at = None;
        self.stale_since = None;
    }

    pub fn approve(&mut self) {
        self.status = StageStatus::Approved;
        self.approved_at = Some(Utc::now());
        self.stale_since = None;
    }

    pub fn mark_stale(&mut self) {
        if self.status != StageStatus::Stale {
            self.status = StageStatus::Stale;
            self.stale_since = Some(Utc::now());
        }
    }

    pub fn mark_draft(&mut self) {
        self.status = StageStatus::Draft;
        self.approved_at = None;
        self.stale_since = None;
    }

    /// Apply a status transition without touching content or version.
    pub fn set_status(&mut self, status: StageStatus) {
        match status {
            StageStatus::Approved => self.approve(),
            StageStatus::Stale => self.mark_stale(),
            StageStatus::Draft => self.mark_draft(),
            StageStatus::Missing => self.status = StageStatus::Missing,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status.is_usable()
    }
}
