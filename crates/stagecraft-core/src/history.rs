use crate::error::Result;
use crate::io;
use crate::paths;
use crate::types::StageType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// IterationRecord
// ---------------------------------------------------------------------------

/// How an accepted iteration got past the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Approved,
    /// The judge never approved; a human accepted the last attempt anyway.
    AcceptedByUser,
    /// Written by hand, no generator or judge involved.
    Manual,
}

impl fmt::Display for JudgeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JudgeVerdict::Approved => f.write_str("approved"),
            JudgeVerdict::AcceptedByUser => f.write_str("accepted_by_user"),
            JudgeVerdict::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub timestamp: DateTime<Utc>,
    pub feedback: String,
    pub judge_verdict: JudgeVerdict,
    pub judge_reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub semantic_summary: String,
    pub attempts: u32,
    pub version_before: u64,
    pub version_after: u64,
}

// ---------------------------------------------------------------------------
// IterationHistory
// ---------------------------------------------------------------------------

/// Append-only audit log, one JSONL file per stage.
///
/// Records are never edited. The only removal is [`IterationHistory::clear`],
/// which drops a stage's whole log when the stage itself is culled.
#[derive(Debug, Clone)]
pub struct IterationHistory {
    root: PathBuf,
}

impl IterationHistory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn append(&self, project: &str, stage: StageType, record: &IterationRecord) -> Result<()> {
        let path = paths::history_path(&self.root, project, stage);
        let line = serde_json::to_string(record)?;
        io::append_line(&path, &line)
    }

    /// All records for a stage, oldest first.
    pub fn all(&self, project: &str, stage: StageType) -> Result<Vec<IterationRecord>> {
        let path = paths::history_path(&self.root, project, stage);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<IterationRecord>(trimmed) {
                Ok(r) => records.push(r),
                Err(e) => {
                    // A torn final line from a crash mid-append is skipped,
                    // not fatal.
                    tracing::warn!(project, stage = %stage, error = %e, "skipping unreadable history line");
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    pub fn count(&self, project: &str, stage: StageType) -> Result<usize> {
        Ok(self.all(project, stage)?.len())
    }

    pub(crate) fn clear(&self, project: &str, stage: StageType) -> Result<()> {
        io::remove_if_exists(&paths::history_path(&self.root, project, stage))?;
        Ok(())
    }

    /// Raw bytes of a stage's log, `None` if it has no log yet.
    pub(crate) fn snapshot(&self, project: &str, stage: StageType) -> Result<Option<Vec<u8>>> {
        io::read_if_exists(&paths::history_path(&self.root, project, stage))
    }

    /// Put a log back exactly as [`IterationHistory::snapshot`] read it.
    pub(crate) fn restore(&self, project: &str, stage: StageType, data: Option<&[u8]>) -> Result<()> {
        let path = paths::history_path(&self.root, project, stage);
        match data {
            Some(bytes) => io::atomic_write(&path, bytes),
            None => io::remove_if_exists(&path).map(|_| ()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
