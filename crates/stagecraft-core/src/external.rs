//! Collaborators backed by external programs.
//!
//! Each program is spawned per call with a single JSON request on stdin and
//! answers on stdout:
//!
//! ```text
//! generator  {"stage", "context", "feedback"}        -> stage content (raw text)
//! judge      {"old", "new", "feedback", "context"}   -> {"approved", "reasoning", "issues"}
//! differ     {"old", "new"}                          -> one-paragraph summary
//! ```
//!
//! A non-zero exit, a timeout or a spawn failure is reported as
//! [`CallError::Transient`]; an answer that cannot be used is
//! [`CallError::Malformed`].

use crate::collaborator::{CallError, ContentGenerator, Judge, SemanticDiffer, Verdict};
use crate::types::StageType;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ExternalCommand {
    argv: Vec<String>,
    timeout: Duration,
}

impl ExternalCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Run the program once with `request` on stdin and return its stdout.
    pub async fn call(&self, request: &serde_json::Value) -> Result<String, CallError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| CallError::Malformed("empty command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CallError::Transient(format!("failed to spawn {program}: {e}")))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| CallError::Malformed(format!("failed to serialize request: {e}")))?;
        let mut stdin = child.stdin.take();
        let feed = async move {
            if let Some(pipe) = stdin.as_mut() {
                match pipe.write_all(&payload).await {
                    Ok(()) => {}
                    // The program exited without reading its input; its exit
                    // status is the real answer.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => {
                        return Err(CallError::Transient(format!(
                            "failed to write to {program}: {e}"
                        )))
                    }
                }
            }
            // Closes the pipe so the program sees end of input.
            drop(stdin);
            Ok(())
        };
        // Feeding stdin and draining stdout run together under one deadline;
        // on expiry the child is dropped and killed.
        let exchange = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output.map_err(|e| CallError::Transient(format!("{program}: {e}")))
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                CallError::Transient(format!("{program} timed out after {:?}", self.timeout))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(CallError::Transient(format!(
                "{program} exited with {code}: {}",
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| CallError::Malformed(format!("{program} wrote non-UTF-8 output")))
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

pub struct CommandGenerator(pub ExternalCommand);

#[async_trait]
impl ContentGenerator for CommandGenerator {
    async fn generate(
        &self,
        stage: StageType,
        context: &str,
        feedback: &str,
    ) -> Result<String, CallError> {
        let request = serde_json::json!({
            "stage": stage,
            "context": context,
            "feedback": feedback,
        });
        let out = self.0.call(&request).await?;
        if out.trim().is_empty() {
            return Err(CallError::Malformed(format!(
                "{} produced no content",
                self.0.program()
            )));
        }
        Ok(out)
    }
}

pub struct CommandJudge(pub ExternalCommand);

#[async_trait]
impl Judge for CommandJudge {
    async fn validate(
        &self,
        old: &str,
        new: &str,
        feedback: &str,
        context: &str,
    ) -> Result<Verdict, CallError> {
        let request = serde_json::json!({
            "old": old,
            "new": new,
            "feedback": feedback,
            "context": context,
        });
        let out = self.0.call(&request).await?;
        Verdict::parse(&out).map_err(|e| CallError::Malformed(e.to_string()))
    }
}

pub struct CommandDiffer(pub ExternalCommand);

#[async_trait]
impl SemanticDiffer for CommandDiffer {
    async fn summarize(&self, old: &str, new: &str) -> Result<String, CallError> {
        let request = serde_json::json!({ "old": old, "new": new });
        Ok(self.0.call(&request).await?.trim().to_string())
    }
}

/// Fallback differ when no summarizer is configured: reports size changes.
pub struct LengthDiffer;

#[async_trait]
impl SemanticDiffer for LengthDiffer {
    async fn summarize(&self, old: &str, new: &str) -> Result<String, CallError> {
        let (before, after) = (old.split_whitespace().count(), new.split_whitespace().count());
        Ok(if old.is_empty() {
            format!("first draft ({after} words)")
        } else {
            format!("rewritten ({before} -> {after} words)")
        })
    }
}

/// Stands in for a generator or judge that has no command configured.
/// Every call fails, so only operations that never reach it succeed.
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn error(&self) -> CallError {
        CallError::Malformed(format!(
            "no {} command configured (set commands.{} in config.yaml)",
            self.0, self.0
        ))
    }
}

#[async_trait]
impl ContentGenerator for Unconfigured {
    async fn generate(&self, _: StageType, _: &str, _: &str) -> Result<String, CallError> {
        Err(self.error())
    }
}

#[async_trait]
impl Judge for Unconfigured {
    async fn validate(&self, _: &str, _: &str, _: &str, _: &str) -> Result<Verdict, CallError> {
        Err(self.error())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
