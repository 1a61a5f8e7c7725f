//! Capability interfaces for the external calls a stage iteration makes.
//!
//! Generation, judging and diff summaries are opaque and slow (often
//! LLM-backed). The coordinator only depends on these traits, so every
//! orchestration rule can be exercised with scripted fakes.

use crate::error::{Result, StageError};
use crate::types::StageType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single external call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Network hiccup, timeout, non-zero exit: worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The collaborator answered, but not in a form we can use. Sampled
    /// answers vary, so this is retried too.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        stage: StageType,
        context: &str,
        feedback: &str,
    ) -> std::result::Result<String, CallError>;
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn validate(
        &self,
        old: &str,
        new: &str,
        feedback: &str,
        context: &str,
    ) -> std::result::Result<Verdict, CallError>;
}

#[async_trait]
pub trait SemanticDiffer: Send + Sync {
    async fn summarize(&self, old: &str, new: &str) -> std::result::Result<String, CallError>;
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Verdict {
    pub fn approve(reasoning: impl Into<String>) -> Self {
        Self {
            approved: true,
            reasoning: reasoning.into(),
            issues: Vec::new(),
        }
    }

    pub fn reject(reasoning: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            approved: false,
            reasoning: reasoning.into(),
            issues,
        }
    }

    /// Parse a judge's raw JSON answer. Accepts a bare object or one wrapped
    /// in a fenced code block, with surrounding prose ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let body = extract_json_object(raw)
            .ok_or_else(|| StageError::ValidationParse(format!("no JSON object in: {}", preview(raw))))?;
        serde_json::from_str(body).map_err(|e| StageError::ValidationParse(e.to_string()))
    }

    /// Feedback text handed to the next generation attempt.
    pub fn as_feedback(&self) -> String {
        let mut out = self.reasoning.trim().to_string();
        if !self.issues.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Issues:");
            for issue in &self.issues {
                out.push_str("\n- ");
                out.push_str(issue.trim());
            }
        }
        out
    }
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(80) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
