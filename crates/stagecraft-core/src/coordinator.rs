//! Drives one iteration of a stage through generate → judge → persist.
//!
//! ```text
//!  Idle ──► Generating ──► Judging ──┬─► Approved ──► finalize
//!              ▲                     │
//!              └──── NeedsRevision ◄─┘   (attempts left)
//!                         │
//!                         └─► returned to the caller (attempts exhausted)
//! ```
//!
//! Finalizing is the only step that mutates the project: write the stage,
//! invalidate everything downstream, append the iteration record, commit.
//! It runs under the project's finalize lock, after rechecking that every
//! dependency is still the version the candidate was generated from. If any
//! step before the commit fails, every document it touched is put back.

use crate::collaborator::{CallError, ContentGenerator, Judge, SemanticDiffer, Verdict};
use crate::committer::{SnapshotCommitter, VersionEntry, VersionId, VersionedCommitter};
use crate::config::{CommitterKind, Config, IterationConfig};
use crate::context::UpstreamContext;
use crate::error::{Result, StageError};
use crate::external::LengthDiffer;
use crate::git::GitCommitter;
use crate::graph::DependencyGraph;
use crate::history::{IterationHistory, IterationRecord, JudgeVerdict};
use crate::lock::ProjectLock;
use crate::pending::{PendingRevision, PendingStore};
use crate::project::Project;
use crate::stage::Stage;
use crate::store::{ArtifactStore, FsArtifactStore};
use crate::types::{Invalidation, StageStatus, StageType};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub project: String,
    pub stage: StageType,
    pub feedback: String,
    /// Overrides the configured attempt budget.
    pub max_attempts: Option<u32>,
    /// Overrides the configured invalidation policy for this call.
    pub invalidation: Option<Invalidation>,
    pub cancel: CancellationToken,
}

impl IterationRequest {
    pub fn new(project: impl Into<String>, stage: StageType, feedback: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stage,
            feedback: feedback.into(),
            max_attempts: None,
            invalidation: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn invalidation(mut self, policy: Invalidation) -> Self {
        self.invalidation = Some(policy);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// The judge approved and the result was applied.
    Approved,
    /// Attempts ran out without approval. Nothing was applied; see `pending`.
    NeedsRevision,
    /// A human applied a candidate the judge never approved.
    AcceptedByUser,
    /// Content written by hand was applied.
    Written,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommitState {
    NotAttempted,
    Committed { version: VersionId },
    /// The write landed but the commit did not; retry with
    /// [`StageCoordinator::commit`].
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationOutcome {
    pub project: String,
    pub stage: StageType,
    pub status: IterationStatus,
    pub attempts: u32,
    pub content: String,
    /// Stage version after the write; `None` when nothing was written.
    pub version: Option<u64>,
    pub cascaded: Vec<StageType>,
    pub invalidation: Invalidation,
    pub commit: CommitState,
    pub last_reasoning: String,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingRevision>,
}

/// Result of an invalidation that was not part of an iteration.
#[derive(Debug, Clone, Serialize)]
pub struct CullOutcome {
    pub stage: StageType,
    pub invalidation: Invalidation,
    pub cascaded: Vec<StageType>,
    pub commit: CommitState,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LockRegistry {
    stages: std::sync::Mutex<HashMap<(String, StageType), Arc<Mutex<()>>>>,
    projects: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn stage(&self, project: &str, stage: StageType) -> Arc<Mutex<()>> {
        let mut map = self.stages.lock().unwrap_or_else(|p| p.into_inner());
        map.entry((project.to_string(), stage)).or_default().clone()
    }

    fn project(&self, project: &str) -> Arc<Mutex<()>> {
        let mut map = self.projects.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(project.to_string()).or_default().clone()
    }
}

/// Held for the whole finalize step.
struct FinalizeGuard {
    _local: OwnedMutexGuard<()>,
    _process: ProjectLock,
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// One stage's documents as they were before finalize touched them.
struct JournalEntry {
    stage: StageType,
    document: Option<Stage>,
    history: Option<Vec<u8>>,
    pending: Option<PendingRevision>,
}

// ---------------------------------------------------------------------------
// StageCoordinator
// ---------------------------------------------------------------------------

pub struct StageCoordinator {
    root: PathBuf,
    store: Arc<dyn ArtifactStore>,
    history: IterationHistory,
    pending: PendingStore,
    committer: Arc<dyn VersionedCommitter>,
    generator: Arc<dyn ContentGenerator>,
    judge: Arc<dyn Judge>,
    differ: Arc<dyn SemanticDiffer>,
    settings: IterationConfig,
    locks: LockRegistry,
}

/// Everything finalize needs to apply one piece of content.
struct Candidate {
    content: String,
    verdict: JudgeVerdict,
    reasoning: String,
    issues: Vec<String>,
    attempts: u32,
    feedback: String,
    invalidation: Invalidation,
    /// Dependency versions the content was produced against.
    observed: BTreeMap<StageType, u64>,
}

struct Applied {
    stage: Stage,
    cascaded: Vec<StageType>,
    commit: CommitState,
}

impl StageCoordinator {
    /// File-backed store and snapshot versioning under `root`, default
    /// iteration settings and a word-count differ.
    pub fn new(
        root: impl Into<PathBuf>,
        generator: Arc<dyn ContentGenerator>,
        judge: Arc<dyn Judge>,
    ) -> Self {
        let root = root.into();
        Self {
            store: Arc::new(FsArtifactStore::new(&root)),
            history: IterationHistory::new(&root),
            pending: PendingStore::new(&root),
            committer: Arc::new(SnapshotCommitter::new(&root)),
            generator,
            judge,
            differ: Arc::new(LengthDiffer),
            settings: IterationConfig::default(),
            locks: LockRegistry::default(),
            root,
        }
    }

    /// Wire a coordinator from the project configuration.
    pub fn from_config(
        root: impl Into<PathBuf>,
        cfg: &Config,
        generator: Arc<dyn ContentGenerator>,
        judge: Arc<dyn Judge>,
        differ: Option<Arc<dyn SemanticDiffer>>,
    ) -> Result<Self> {
        let root = root.into();
        let committer: Arc<dyn VersionedCommitter> = match cfg.committer {
            CommitterKind::Snapshot => Arc::new(SnapshotCommitter::new(&root)),
            CommitterKind::Git => Arc::new(GitCommitter::new(&root)?),
        };
        let mut coordinator = Self::new(root, generator, judge)
            .with_committer(committer)
            .with_settings(cfg.iteration.clone());
        if let Some(differ) = differ {
            coordinator = coordinator.with_differ(differ);
        }
        Ok(coordinator)
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn VersionedCommitter>) -> Self {
        self.committer = committer;
        self
    }

    pub fn with_differ(mut self, differ: Arc<dyn SemanticDiffer>) -> Self {
        self.differ = differ;
        self
    }

    pub fn with_settings(mut self, settings: IterationConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    pub fn history(&self) -> &IterationHistory {
        &self.history
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    // ---------------------------------------------------------------------------
    // Iterate
    // ---------------------------------------------------------------------------

    /// Run one iteration cycle for `req.stage`.
    ///
    /// Fails with `DependencyNotReady` before any generator call if a
    /// dependency is missing or stale. When every attempt is rejected the
    /// outcome is `NeedsRevision`, the last candidate is parked as a pending
    /// revision, and nothing is written.
    pub async fn iterate(&self, req: IterationRequest) -> Result<IterationOutcome> {
        let project = Project::load(&self.root, &req.project)?;
        let stage = req.stage;
        let max_attempts = req.max_attempts.unwrap_or(self.settings.max_attempts).max(1);
        let invalidation = req.invalidation.unwrap_or(self.settings.invalidation);

        let pair = self.locks.stage(&project.name, stage);
        let _pair_guard = tokio::select! {
            guard = pair.lock_owned() => guard,
            _ = req.cancel.cancelled() => {
                return Err(StageError::Cancelled { stage, attempts: 0 });
            }
        };

        let graph = self.graph(&project, stage)?;
        let dependencies = self.ready_dependencies(&project.name, stage, &graph)?;
        let observed: BTreeMap<_, _> = dependencies
            .iter()
            .map(|d| (d.stage_type, d.version))
            .collect();

        let current = self.read_optional(&project.name, stage)?;
        let old_content = current.as_ref().map(|s| s.content.clone()).unwrap_or_default();
        let base_version = current.as_ref().map(|s| s.version).unwrap_or(0);

        let context = UpstreamContext {
            dependencies,
            history: self.history.all(&project.name, stage)?,
        }
        .render();

        tracing::info!(project = %project.name, stage = %stage, max_attempts, "iteration started");

        let mut notes: Vec<String> = Vec::new();
        let mut last: Option<(String, Verdict)> = None;
        let mut last_generation_error: Option<CallError> = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            if req.cancel.is_cancelled() {
                tracing::info!(project = %project.name, stage = %stage, attempts, "iteration cancelled");
                return Err(StageError::Cancelled { stage, attempts });
            }
            attempts = attempt;

            tracing::debug!(stage = %stage, attempt, "generating");
            let feedback = compose_feedback(&req.feedback, &notes);
            let candidate = match self.generate_with_retry(stage, &context, &feedback).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(stage = %stage, attempt, error = %e, "generation attempt failed");
                    notes.push(format!("Attempt {attempt} produced no content: {e}"));
                    last_generation_error = Some(e);
                    continue;
                }
            };

            tracing::debug!(stage = %stage, attempt, "judging");
            let verdict = self
                .judge_with_retry(&old_content, &candidate, &req.feedback, &context)
                .await;
            let approved = verdict.approved;
            if !approved {
                notes.push(format!("Attempt {attempt} was rejected: {}", verdict.as_feedback()));
            }
            last = Some((candidate, verdict));
            if approved {
                break;
            }
        }

        let Some((content, verdict)) = last else {
            let message = last_generation_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts ran".to_string());
            return Err(StageError::Generation {
                stage,
                attempts,
                message,
            });
        };

        if !verdict.approved {
            let pending = PendingRevision {
                project: project.name.clone(),
                stage,
                content: content.clone(),
                feedback: req.feedback.clone(),
                attempts,
                verdict: verdict.clone(),
                base_version,
                dependency_versions: observed,
                created_at: Utc::now(),
            };
            self.pending.save(&pending)?;
            tracing::info!(project = %project.name, stage = %stage, attempts, "needs revision");
            return Ok(IterationOutcome {
                project: project.name,
                stage,
                status: IterationStatus::NeedsRevision,
                attempts,
                content,
                version: None,
                cascaded: Vec::new(),
                invalidation,
                commit: CommitState::NotAttempted,
                last_reasoning: verdict.reasoning,
                issues: verdict.issues,
                pending: Some(pending),
            });
        }

        let applied = self
            .apply(
                &project,
                stage,
                &old_content,
                Candidate {
                    content: content.clone(),
                    verdict: JudgeVerdict::Approved,
                    reasoning: verdict.reasoning.clone(),
                    issues: verdict.issues.clone(),
                    attempts,
                    feedback: req.feedback.clone(),
                    invalidation,
                    observed,
                },
            )
            .await?;

        Ok(IterationOutcome {
            project: project.name,
            stage,
            status: IterationStatus::Approved,
            attempts,
            content,
            version: Some(applied.stage.version),
            cascaded: applied.cascaded,
            invalidation,
            commit: applied.commit,
            last_reasoning: verdict.reasoning,
            issues: verdict.issues,
            pending: None,
        })
    }

    // ---------------------------------------------------------------------------
    // Human decisions
    // ---------------------------------------------------------------------------

    /// Apply the pending revision of a stage despite the judge's rejection.
    /// The stage ends up as a draft, not approved.
    pub async fn accept(
        &self,
        project: &str,
        stage: StageType,
        invalidation: Option<Invalidation>,
    ) -> Result<IterationOutcome> {
        let project = Project::load(&self.root, project)?;
        let pair = self.locks.stage(&project.name, stage);
        let _pair_guard = pair.lock_owned().await;

        let pending = self
            .pending
            .load(&project.name, stage)?
            .ok_or_else(|| StageError::NoPending {
                project: project.name.clone(),
                stage,
            })?;
        let invalidation = invalidation.unwrap_or(self.settings.invalidation);
        let old_content = self
            .read_optional(&project.name, stage)?
            .map(|s| s.content)
            .unwrap_or_default();

        let applied = self
            .apply(
                &project,
                stage,
                &old_content,
                Candidate {
                    content: pending.content.clone(),
                    verdict: JudgeVerdict::AcceptedByUser,
                    reasoning: pending.verdict.reasoning.clone(),
                    issues: pending.verdict.issues.clone(),
                    attempts: pending.attempts,
                    feedback: pending.feedback.clone(),
                    invalidation,
                    observed: pending.dependency_versions.clone(),
                },
            )
            .await?;

        Ok(IterationOutcome {
            project: project.name,
            stage,
            status: IterationStatus::AcceptedByUser,
            attempts: pending.attempts,
            content: pending.content,
            version: Some(applied.stage.version),
            cascaded: applied.cascaded,
            invalidation,
            commit: applied.commit,
            last_reasoning: pending.verdict.reasoning,
            issues: pending.verdict.issues,
            pending: None,
        })
    }

    /// Discard the pending revision of a stage.
    pub fn abandon(&self, project: &str, stage: StageType) -> Result<PendingRevision> {
        let project = Project::load(&self.root, project)?;
        let pending = self
            .pending
            .load(&project.name, stage)?
            .ok_or_else(|| StageError::NoPending {
                project: project.name.clone(),
                stage,
            })?;
        self.pending.remove(&project.name, stage)?;
        tracing::info!(project = %project.name, stage = %stage, "pending revision abandoned");
        Ok(pending)
    }

    /// Apply hand-written content to a stage. Dependencies must be ready, as
    /// for a generated iteration; the stage is approved on write.
    pub async fn write(
        &self,
        project: &str,
        stage: StageType,
        content: &str,
        invalidation: Option<Invalidation>,
    ) -> Result<IterationOutcome> {
        let project = Project::load(&self.root, project)?;
        let pair = self.locks.stage(&project.name, stage);
        let _pair_guard = pair.lock_owned().await;

        let graph = self.graph(&project, stage)?;
        let observed = self
            .ready_dependencies(&project.name, stage, &graph)?
            .iter()
            .map(|d| (d.stage_type, d.version))
            .collect();
        let invalidation = invalidation.unwrap_or(self.settings.invalidation);
        let old_content = self
            .read_optional(&project.name, stage)?
            .map(|s| s.content)
            .unwrap_or_default();

        let applied = self
            .apply(
                &project,
                stage,
                &old_content,
                Candidate {
                    content: content.to_string(),
                    verdict: JudgeVerdict::Manual,
                    reasoning: "written by hand".to_string(),
                    issues: Vec::new(),
                    attempts: 0,
                    feedback: String::new(),
                    invalidation,
                    observed,
                },
            )
            .await?;

        Ok(IterationOutcome {
            project: project.name,
            stage,
            status: IterationStatus::Written,
            attempts: 0,
            content: content.to_string(),
            version: Some(applied.stage.version),
            cascaded: applied.cascaded,
            invalidation,
            commit: applied.commit,
            last_reasoning: String::new(),
            issues: Vec::new(),
            pending: None,
        })
    }

    /// Mark a draft stage approved by a human.
    pub async fn approve(&self, project: &str, stage: StageType) -> Result<(Stage, CommitState)> {
        let project = Project::load(&self.root, project)?;
        let _guard = self.finalize_guard(&project.name).await?;

        let current = self.store.read(&project.name, stage)?;
        if current.status != StageStatus::Draft && current.status != StageStatus::Approved {
            return Err(StageError::InvalidTransition {
                stage,
                from: current.status,
                to: StageStatus::Approved,
            });
        }
        let updated = self
            .store
            .set_status(&project.name, stage, StageStatus::Approved)?;
        let commit = self
            .commit_with_retry(&project.name, &format!("approve {stage}"))
            .await;
        Ok((updated, commit))
    }

    /// Invalidate everything downstream of `stage` without touching `stage`.
    pub async fn cull(
        &self,
        project: &str,
        stage: StageType,
        invalidation: Invalidation,
    ) -> Result<CullOutcome> {
        let project = Project::load(&self.root, project)?;
        let _guard = self.finalize_guard(&project.name).await?;

        let stored = self.store.list(&project.name)?;
        let graph = project.graph_for(&stored);
        let touched: Vec<StageType> = graph.cascade_of(stage).into_iter().collect();
        let cascaded = self.transaction(&project.name, &touched, || {
            self.invalidate_downstream(&project.name, stage, &graph, invalidation)
        })?;
        let commit = if cascaded.is_empty() {
            CommitState::NotAttempted
        } else {
            self.commit_with_retry(
                &project.name,
                &format!("{invalidation} downstream of {stage}"),
            )
            .await
        };
        Ok(CullOutcome {
            stage,
            invalidation,
            cascaded,
            commit,
        })
    }

    /// Delete a stage with its history and invalidate everything downstream.
    pub async fn remove(
        &self,
        project: &str,
        stage: StageType,
        invalidation: Invalidation,
    ) -> Result<CullOutcome> {
        let project = Project::load(&self.root, project)?;
        let _guard = self.finalize_guard(&project.name).await?;

        let stored = self.store.list(&project.name)?;
        let graph = project.graph_for(&stored);
        let touched: Vec<StageType> = std::iter::once(stage).chain(graph.cascade_of(stage)).collect();
        let cascaded = self.transaction(&project.name, &touched, || {
            self.drop_stage(&project.name, stage)?;
            self.invalidate_downstream(&project.name, stage, &graph, invalidation)
        })?;
        let commit = self
            .commit_with_retry(&project.name, &format!("delete {stage}"))
            .await;
        Ok(CullOutcome {
            stage,
            invalidation,
            cascaded,
            commit,
        })
    }

    // ---------------------------------------------------------------------------
    // Versioning
    // ---------------------------------------------------------------------------

    /// Commit the project as it is now, e.g. after a failed commit.
    pub async fn commit(&self, project: &str, message: &str) -> Result<VersionId> {
        let project = Project::load(&self.root, project)?;
        let _guard = self.finalize_guard(&project.name).await?;
        let committer = Arc::clone(&self.committer);
        let message = message.to_string();
        blocking(move || committer.commit(&project.name, &message)).await
    }

    pub async fn revert(&self, project: &str, version: &str) -> Result<()> {
        let project = Project::load(&self.root, project)?;
        let _guard = self.finalize_guard(&project.name).await?;
        let committer = Arc::clone(&self.committer);
        let (name, version) = (project.name.clone(), version.to_string());
        blocking(move || committer.revert(&name, &version)).await?;
        // Candidates were built against content that no longer exists.
        self.pending.clear(&project.name)
    }

    pub fn versions(&self, project: &str) -> Result<Vec<VersionEntry>> {
        let project = Project::load(&self.root, project)?;
        self.committer.history(&project.name)
    }

    // ---------------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------------

    fn graph(&self, project: &Project, stage: StageType) -> Result<DependencyGraph> {
        let stored = self.store.list(&project.name)?;
        let graph = project.graph_for(&stored);
        if !graph.contains(stage) {
            return Err(StageError::UnknownStage {
                project: project.name.clone(),
                stage,
                chapters: graph.chapters(),
            });
        }
        Ok(graph)
    }

    fn read_optional(&self, project: &str, stage: StageType) -> Result<Option<Stage>> {
        match self.store.read(project, stage) {
            Ok(s) => Ok(Some(s)),
            Err(StageError::StageNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load every dependency of `stage`, failing on the first that is
    /// missing or stale.
    fn ready_dependencies(
        &self,
        project: &str,
        stage: StageType,
        graph: &DependencyGraph,
    ) -> Result<Vec<Stage>> {
        let mut ready = Vec::new();
        for &dependency in graph.dependencies_of(stage) {
            let loaded = self.read_optional(project, dependency)?;
            let status = loaded.as_ref().map(|s| s.status).unwrap_or(StageStatus::Missing);
            match loaded {
                Some(s) if s.is_usable() => ready.push(s),
                _ => {
                    return Err(StageError::DependencyNotReady {
                        stage,
                        dependency,
                        status,
                    })
                }
            }
        }
        Ok(ready)
    }

    /// Serializes finalization within this process, then waits for any
    /// other process finalizing the same project.
    async fn finalize_guard(&self, project: &str) -> Result<FinalizeGuard> {
        let local = self.locks.project(project).lock_owned().await;
        let (root, name) = (self.root.clone(), project.to_string());
        let process = blocking(move || ProjectLock::wait(&root, &name)).await?;
        Ok(FinalizeGuard {
            _local: local,
            _process: process,
        })
    }

    /// Write, invalidate downstream, record, commit.
    async fn apply(
        &self,
        project: &Project,
        stage: StageType,
        old_content: &str,
        candidate: Candidate,
    ) -> Result<Applied> {
        let summary = match self.differ.summarize(old_content, &candidate.content).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(stage = %stage, error = %e, "semantic summary unavailable");
                format!("summary unavailable: {e}")
            }
        };

        let _guard = self.finalize_guard(&project.name).await?;

        // Dependencies may have moved on while we were generating.
        let graph = self.graph(project, stage)?;
        let dependencies = self.ready_dependencies(&project.name, stage, &graph)?;
        for dep in &dependencies {
            if let Some(&seen) = candidate.observed.get(&dep.stage_type) {
                if seen != dep.version {
                    return Err(StageError::DependencyChanged {
                        stage,
                        dependency: dep.stage_type,
                    });
                }
            }
        }

        let version_before = self
            .read_optional(&project.name, stage)?
            .map(|s| s.version)
            .unwrap_or(0);

        let touched: Vec<StageType> = std::iter::once(stage).chain(graph.cascade_of(stage)).collect();
        let (written, cascaded) = self.transaction(&project.name, &touched, || {
            let mut written = self.store.write(&project.name, stage, &candidate.content)?;
            if candidate.verdict != JudgeVerdict::AcceptedByUser {
                written = self
                    .store
                    .set_status(&project.name, stage, StageStatus::Approved)?;
            }

            let cascaded =
                self.invalidate_downstream(&project.name, stage, &graph, candidate.invalidation)?;

            self.history.append(
                &project.name,
                stage,
                &IterationRecord {
                    timestamp: Utc::now(),
                    feedback: candidate.feedback.clone(),
                    judge_verdict: candidate.verdict,
                    judge_reasoning: candidate.reasoning.clone(),
                    issues: candidate.issues.clone(),
                    semantic_summary: summary,
                    attempts: candidate.attempts,
                    version_before,
                    version_after: written.version,
                },
            )?;
            self.pending.remove(&project.name, stage)?;
            Ok((written, cascaded))
        })?;

        tracing::info!(
            project = %project.name,
            stage = %stage,
            version = written.version,
            cascaded = cascaded.len(),
            verdict = %candidate.verdict,
            "stage finalized"
        );

        let commit = self
            .commit_with_retry(
                &project.name,
                &commit_message(stage, written.version, candidate.verdict, &candidate.feedback),
            )
            .await;

        Ok(Applied {
            stage: written,
            cascaded,
            commit,
        })
    }

    /// Run `mutate`, putting every document of `stages` back the way it was
    /// if it fails. Nothing is committed either way.
    fn transaction<T>(
        &self,
        project: &str,
        stages: &[StageType],
        mutate: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let journal = stages
            .iter()
            .map(|&stage| {
                Ok(JournalEntry {
                    stage,
                    document: self.read_optional(project, stage)?,
                    history: self.history.snapshot(project, stage)?,
                    pending: self.pending.load(project, stage)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        mutate().inspect_err(|e| {
            tracing::warn!(project, error = %e, "finalize failed, restoring previous state");
            self.roll_back(project, journal);
        })
    }

    /// Best effort: every entry is attempted even if an earlier one fails.
    fn roll_back(&self, project: &str, journal: Vec<JournalEntry>) {
        for entry in journal.into_iter().rev() {
            let stage = entry.stage;
            let document = match &entry.document {
                Some(doc) => self.store.put(project, doc),
                None => self.store.delete(project, stage),
            };
            let history = self.history.restore(project, stage, entry.history.as_deref());
            let pending = match &entry.pending {
                Some(p) => self.pending.save(p),
                None => self.pending.remove(project, stage).map(|_| ()),
            };
            for result in [document, history, pending] {
                if let Err(e) = result {
                    tracing::error!(project, stage = %stage, error = %e, "could not restore stage");
                }
            }
        }
    }

    /// Apply `policy` to every stored stage downstream of `stage`.
    fn invalidate_downstream(
        &self,
        project: &str,
        stage: StageType,
        graph: &DependencyGraph,
        policy: Invalidation,
    ) -> Result<Vec<StageType>> {
        let stored = self.store.list(project)?;
        let mut affected = Vec::new();
        for downstream in graph.cascade_of(stage) {
            if !stored.contains(&downstream) {
                // Pending candidates were built on the old upstream too.
                self.pending.remove(project, downstream)?;
                continue;
            }
            match policy {
                Invalidation::CullAll => self.drop_stage(project, downstream)?,
                Invalidation::KeepAll => {
                    self.store
                        .set_status(project, downstream, StageStatus::Stale)?;
                    self.pending.remove(project, downstream)?;
                }
            }
            affected.push(downstream);
        }
        if !affected.is_empty() {
            tracing::info!(project, stage = %stage, policy = %policy, count = affected.len(), "cascade applied");
        }
        Ok(affected)
    }

    /// Remove a stage, its iteration history and any pending revision.
    fn drop_stage(&self, project: &str, stage: StageType) -> Result<()> {
        self.store.delete(project, stage)?;
        self.history.clear(project, stage)?;
        self.pending.remove(project, stage)?;
        Ok(())
    }

    /// The write is the source of truth; a commit that keeps failing is
    /// reported, not rolled back.
    async fn commit_with_retry(&self, project: &str, message: &str) -> CommitState {
        let mut tries = 0;
        loop {
            let committer = Arc::clone(&self.committer);
            let (name, text) = (project.to_string(), message.to_string());
            match blocking(move || committer.commit(&name, &text)).await {
                Ok(version) => return CommitState::Committed { version },
                Err(e) if tries < self.settings.commit_retries => {
                    tries += 1;
                    tracing::warn!(project, error = %e, tries, "commit failed, retrying");
                }
                Err(e) => {
                    tracing::error!(project, error = %e, "commit failed; content is written but not versioned");
                    return CommitState::Failed {
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn generate_with_retry(
        &self,
        stage: StageType,
        context: &str,
        feedback: &str,
    ) -> std::result::Result<String, CallError> {
        let mut tries = 0;
        loop {
            match self.generator.generate(stage, context, feedback).await {
                Ok(content) => return Ok(content),
                Err(e) if tries < self.settings.transient_retries => {
                    tries += 1;
                    tracing::warn!(stage = %stage, error = %e, transient = e.is_transient(), tries, "generator failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Never fails: an unusable judge answer becomes a rejection.
    async fn judge_with_retry(&self, old: &str, new: &str, feedback: &str, context: &str) -> Verdict {
        let mut tries = 0;
        loop {
            match self.judge.validate(old, new, feedback, context).await {
                Ok(verdict) => return verdict,
                Err(e) if tries < self.settings.transient_retries => {
                    tries += 1;
                    tracing::warn!(error = %e, transient = e.is_transient(), tries, "judge failed, retrying");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "validator error; treating as needs revision");
                    return Verdict::reject(format!("validator error: {e}"), Vec::new());
                }
            }
        }
    }
}

/// Run blocking filesystem or `git` work on the blocking thread pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StageError::StoreIo(std::io::Error::other(e)))?
}

fn compose_feedback(feedback: &str, notes: &[String]) -> String {
    if notes.is_empty() {
        return feedback.to_string();
    }
    let mut out = feedback.trim_end().to_string();
    out.push_str("\n\nJudge feedback on previous attempts:\n");
    for note in notes {
        out.push('\n');
        out.push_str(note);
        out.push('\n');
    }
    out
}

fn commit_message(stage: StageType, version: u64, verdict: JudgeVerdict, feedback: &str) -> String {
    let headline = feedback.lines().next().unwrap_or("").trim();
    if headline.is_empty() {
        format!("{stage} v{version} ({verdict})")
    } else {
        format!("{stage} v{version} ({verdict}): {headline}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
