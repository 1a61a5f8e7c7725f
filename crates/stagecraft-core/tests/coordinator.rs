use async_trait::async_trait;
use stagecraft_core::collaborator::{CallError, ContentGenerator, Judge, Verdict};
use stagecraft_core::committer::{SnapshotCommitter, VersionEntry, VersionId, VersionedCommitter};
use stagecraft_core::config::IterationConfig;
use stagecraft_core::coordinator::{CommitState, IterationRequest, IterationStatus, StageCoordinator};
use stagecraft_core::history::JudgeVerdict;
use stagecraft_core::lock::ProjectLock;
use stagecraft_core::paths;
use stagecraft_core::project::Project;
use stagecraft_core::stage::Stage;
use stagecraft_core::store::{ArtifactStore, FsArtifactStore};
use stagecraft_core::types::{Invalidation, StageStatus, StageType};
use stagecraft_core::StageError;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, CallError>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(script: Vec<Result<String, CallError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        stage: StageType,
        _context: &str,
        _feedback: &str,
    ) -> Result<String, CallError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{stage} draft {n}")))
    }
}

#[derive(Default)]
struct ScriptedJudge {
    script: Mutex<VecDeque<Result<Verdict, CallError>>>,
    reject_rest: bool,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    fn approving() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn scripted(script: Vec<Result<Verdict, CallError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject_rest: true,
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn validate(
        &self,
        _old: &str,
        _new: &str,
        _feedback: &str,
        _context: &str,
    ) -> Result<Verdict, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        if self.reject_rest {
            Ok(Verdict::reject("still too small", vec!["no war".into()]))
        } else {
            Ok(Verdict::approve("meets the brief"))
        }
    }
}

/// Snapshot committer that counts commits and can be told to fail.
struct CountingCommitter {
    inner: SnapshotCommitter,
    commits: AtomicUsize,
    fail: AtomicBool,
}

impl CountingCommitter {
    fn new(root: &std::path::Path) -> Arc<Self> {
        Arc::new(Self {
            inner: SnapshotCommitter::new(root),
            commits: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl VersionedCommitter for CountingCommitter {
    fn commit(&self, project: &str, message: &str) -> stagecraft_core::Result<VersionId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StageError::Commit("disk full".into()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(project, message)
    }

    fn revert(&self, project: &str, version: &str) -> stagecraft_core::Result<()> {
        self.inner.revert(project, version)
    }

    fn history(&self, project: &str) -> stagecraft_core::Result<Vec<VersionEntry>> {
        self.inner.history(project)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    generator: Arc<ScriptedGenerator>,
    judge: Arc<ScriptedJudge>,
    committer: Arc<CountingCommitter>,
    coordinator: StageCoordinator,
}

impl Harness {
    fn new(generator: Arc<ScriptedGenerator>, judge: Arc<ScriptedJudge>) -> Self {
        Self::with_chapters(generator, judge, 2)
    }

    fn with_chapters(
        generator: Arc<ScriptedGenerator>,
        judge: Arc<ScriptedJudge>,
        chapters: u32,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        Project::create(dir.path(), "novel", None, chapters).unwrap();
        let committer = CountingCommitter::new(dir.path());
        let coordinator =
            StageCoordinator::new(dir.path(), generator.clone(), judge.clone())
                .with_committer(committer.clone());
        Self {
            dir,
            generator,
            judge,
            committer,
            coordinator,
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    async fn seed(&self, stages: &[StageType]) {
        for &stage in stages {
            self.coordinator
                .write("novel", stage, &format!("{stage} by hand"), None)
                .await
                .unwrap();
        }
    }

    fn status(&self, stage: StageType) -> StageStatus {
        self.coordinator.store().status("novel", stage).unwrap()
    }
}

fn request(stage: StageType) -> IterationRequest {
    IterationRequest::new("novel", stage, "make it epic")
}

const HEAD: [StageType; 3] = [
    StageType::Premise,
    StageType::Treatment,
    StageType::StructurePlan,
];

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_dependency_blocks_before_generation() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&[StageType::Premise, StageType::Treatment]).await;
    h.coordinator
        .cull("novel", StageType::Premise, Invalidation::KeepAll)
        .await
        .unwrap();
    assert_eq!(h.status(StageType::Treatment), StageStatus::Stale);

    let err = h
        .coordinator
        .iterate(request(StageType::StructurePlan))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::DependencyNotReady {
            dependency: StageType::Treatment,
            status: StageStatus::Stale,
            ..
        }
    ));
    assert_eq!(h.generator.calls(), 0);
    assert_eq!(h.judge.calls(), 0);
}

#[tokio::test]
async fn missing_dependency_blocks() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    let err = h
        .coordinator
        .iterate(request(StageType::Treatment))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::DependencyNotReady {
            dependency: StageType::Premise,
            status: StageStatus::Missing,
            ..
        }
    ));
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test]
async fn stage_outside_planned_chapters_is_unknown() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    let err = h
        .coordinator
        .iterate(request(StageType::Prose(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::UnknownStage { chapters: 2, .. }));
}

// ---------------------------------------------------------------------------
// Approval loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approved_on_second_attempt() {
    let judge = ScriptedJudge::scripted(vec![Ok(Verdict::reject("too small", vec![]))]);
    let h = Harness::new(ScriptedGenerator::new(vec![]), judge);
    h.seed(&[StageType::Premise]).await;
    let commits_before = h.committer.commits();

    let outcome = h
        .coordinator
        .iterate(request(StageType::Treatment))
        .await
        .unwrap();

    assert_eq!(outcome.status, IterationStatus::Approved);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.version, Some(1));
    assert_eq!(outcome.content, "treatment draft 2");
    assert_eq!(h.generator.calls(), 2);
    assert_eq!(h.judge.calls(), 2);
    assert_eq!(h.committer.commits() - commits_before, 1);
    assert!(matches!(outcome.commit, CommitState::Committed { .. }));

    let stored = h.coordinator.store().read("novel", StageType::Treatment).unwrap();
    assert_eq!(stored.status, StageStatus::Approved);
    assert_eq!(stored.content, "treatment draft 2");

    let records = h.coordinator.history().all("novel", StageType::Treatment).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].judge_verdict, JudgeVerdict::Approved);
    assert_eq!(records[0].attempts, 2);
    assert_eq!(records[0].version_before, 0);
    assert_eq!(records[0].version_after, 1);
}

#[tokio::test]
async fn iterating_premise_culls_downstream() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&[StageType::Premise, StageType::Treatment]).await;

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise).invalidation(Invalidation::CullAll))
        .await
        .unwrap();

    assert_eq!(outcome.cascaded, vec![StageType::Treatment]);
    assert_eq!(outcome.version, Some(2));
    assert_eq!(h.status(StageType::Premise), StageStatus::Approved);
    assert_eq!(h.status(StageType::Treatment), StageStatus::Missing);
    assert_eq!(
        h.coordinator
            .history()
            .count("novel", StageType::Treatment)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn keep_all_marks_downstream_stale() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&HEAD).await;

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise).invalidation(Invalidation::KeepAll))
        .await
        .unwrap();

    assert_eq!(
        outcome.cascaded,
        vec![StageType::Treatment, StageType::StructurePlan]
    );
    assert_eq!(h.status(StageType::Treatment), StageStatus::Stale);
    assert_eq!(h.status(StageType::StructurePlan), StageStatus::Stale);
    let kept = h.coordinator.store().read("novel", StageType::Treatment).unwrap();
    assert_eq!(kept.content, "treatment by hand");
}

#[tokio::test]
async fn exhausted_attempts_leave_stage_untouched() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::rejecting());
    h.seed(&[StageType::Premise]).await;
    let commits_before = h.committer.commits();

    let outcome = h
        .coordinator
        .iterate(request(StageType::Treatment).max_attempts(3))
        .await
        .unwrap();

    assert_eq!(outcome.status, IterationStatus::NeedsRevision);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.version, None);
    assert_eq!(outcome.commit, CommitState::NotAttempted);
    assert_eq!(outcome.last_reasoning, "still too small");
    assert_eq!(h.generator.calls(), 3);
    assert_eq!(h.committer.commits(), commits_before);
    assert_eq!(h.status(StageType::Treatment), StageStatus::Missing);

    let pending = h
        .coordinator
        .pending()
        .load("novel", StageType::Treatment)
        .unwrap()
        .unwrap();
    assert_eq!(pending.content, "treatment draft 3");
    assert_eq!(pending.dependency_versions[&StageType::Premise], 1);
}

// ---------------------------------------------------------------------------
// Collaborator failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_generator_failure_is_retried() {
    let generator = ScriptedGenerator::new(vec![
        Err(CallError::Transient("503".into())),
        Ok("a premise".into()),
    ]);
    let h = Harness::new(generator, ScriptedJudge::approving());

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise))
        .await
        .unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.content, "a premise");
    assert_eq!(h.generator.calls(), 2);
}

#[tokio::test]
async fn generator_that_never_answers_fails() {
    // Two attempts, each with the default two extra tries.
    let generator = ScriptedGenerator::new(vec![Err(CallError::Malformed("empty".into())); 6]);
    let h = Harness::new(generator, ScriptedJudge::approving());

    let err = h
        .coordinator
        .iterate(request(StageType::Premise).max_attempts(2))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Generation { attempts: 2, .. }));
    assert_eq!(h.generator.calls(), 6);
    assert_eq!(h.judge.calls(), 0);
    assert_eq!(h.status(StageType::Premise), StageStatus::Missing);
}

#[tokio::test]
async fn malformed_generator_output_is_retried() {
    let generator = ScriptedGenerator::new(vec![
        Err(CallError::Malformed("empty output".into())),
        Ok("a premise".into()),
    ]);
    let h = Harness::new(generator, ScriptedJudge::approving());

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise).max_attempts(1))
        .await
        .unwrap();
    assert_eq!(outcome.status, IterationStatus::Approved);
    assert_eq!(outcome.content, "a premise");
    assert_eq!(h.generator.calls(), 2);
}

#[tokio::test]
async fn malformed_judge_answer_is_retried() {
    let judge = ScriptedJudge::scripted(vec![Err(CallError::Malformed("LGTM".into()))]);
    let h = Harness::new(ScriptedGenerator::new(vec![]), judge);

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise).max_attempts(1))
        .await
        .unwrap();
    assert_eq!(outcome.status, IterationStatus::Approved);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.judge.calls(), 2);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn judge_that_keeps_answering_garbage_counts_as_rejection() {
    let judge = ScriptedJudge::scripted(vec![Err(CallError::Malformed("LGTM".into())); 3]);
    let h = Harness::new(ScriptedGenerator::new(vec![]), judge);

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise).max_attempts(1))
        .await
        .unwrap();
    assert_eq!(outcome.status, IterationStatus::NeedsRevision);
    assert!(outcome.last_reasoning.starts_with("validator error"));
    assert_eq!(h.judge.calls(), 3);
}

#[tokio::test]
async fn cancelled_request_stops_before_generating() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .coordinator
        .iterate(request(StageType::Premise).cancel_token(token))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Cancelled { attempts: 0, .. }));
    assert_eq!(h.generator.calls(), 0);
}

// ---------------------------------------------------------------------------
// Human decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accept_applies_pending_as_draft() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::rejecting());
    h.seed(&[StageType::Premise]).await;
    h.coordinator
        .iterate(request(StageType::Treatment).max_attempts(1))
        .await
        .unwrap();

    let outcome = h
        .coordinator
        .accept("novel", StageType::Treatment, None)
        .await
        .unwrap();
    assert_eq!(outcome.status, IterationStatus::AcceptedByUser);
    assert_eq!(h.status(StageType::Treatment), StageStatus::Draft);

    let records = h.coordinator.history().all("novel", StageType::Treatment).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].judge_verdict, JudgeVerdict::AcceptedByUser);
    assert!(h
        .coordinator
        .pending()
        .load("novel", StageType::Treatment)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn abandon_discards_pending() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::rejecting());
    h.coordinator
        .iterate(request(StageType::Premise).max_attempts(1))
        .await
        .unwrap();

    let dropped = h.coordinator.abandon("novel", StageType::Premise).unwrap();
    assert_eq!(dropped.attempts, 1);
    assert!(matches!(
        h.coordinator.abandon("novel", StageType::Premise),
        Err(StageError::NoPending { .. })
    ));
    assert_eq!(h.status(StageType::Premise), StageStatus::Missing);
}

#[tokio::test]
async fn rewriting_upstream_drops_downstream_pending() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::rejecting());
    h.seed(&[StageType::Premise]).await;
    h.coordinator
        .iterate(request(StageType::Treatment).max_attempts(1))
        .await
        .unwrap();

    h.seed(&[StageType::Premise]).await;
    assert!(matches!(
        h.coordinator.accept("novel", StageType::Treatment, None).await,
        Err(StageError::NoPending { .. })
    ));
}

#[tokio::test]
async fn approve_rejects_stale_stage() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&[StageType::Premise, StageType::Treatment]).await;
    h.coordinator
        .cull("novel", StageType::Premise, Invalidation::KeepAll)
        .await
        .unwrap();

    let err = h
        .coordinator
        .approve("novel", StageType::Treatment)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::InvalidTransition {
            from: StageStatus::Stale,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_commit_keeps_write_and_can_be_retried() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.committer.fail.store(true, Ordering::SeqCst);

    let outcome = h
        .coordinator
        .iterate(request(StageType::Premise))
        .await
        .unwrap();
    assert!(matches!(outcome.commit, CommitState::Failed { .. }));
    assert_eq!(h.status(StageType::Premise), StageStatus::Approved);

    h.committer.fail.store(false, Ordering::SeqCst);
    let version = h.coordinator.commit("novel", "retry").await.unwrap();
    assert_eq!(version, "v0001");
}

#[tokio::test]
async fn revert_restores_earlier_content() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&[StageType::Premise]).await;
    h.coordinator
        .iterate(request(StageType::Premise))
        .await
        .unwrap();

    h.coordinator.revert("novel", "v0001").await.unwrap();
    let premise = h.coordinator.store().read("novel", StageType::Premise).unwrap();
    assert_eq!(premise.content, "premise by hand");
    assert_eq!(h.coordinator.versions("novel").unwrap().len(), 3);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn independent_stages_iterate_concurrently() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&HEAD).await;
    h.seed(&[StageType::ChapterPlan(0)]).await;

    let (prose, plan) = tokio::join!(
        h.coordinator.iterate(request(StageType::Prose(0))),
        h.coordinator.iterate(request(StageType::ChapterPlan(1))),
    );
    assert_eq!(prose.unwrap().status, IterationStatus::Approved);
    assert_eq!(plan.unwrap().status, IterationStatus::Approved);
    assert_eq!(h.status(StageType::Prose(0)), StageStatus::Approved);
    assert_eq!(h.status(StageType::ChapterPlan(1)), StageStatus::Approved);
}

/// Rewrites the premise behind the coordinator's back while generating.
struct MeddlingGenerator {
    store: FsArtifactStore,
}

#[async_trait]
impl ContentGenerator for MeddlingGenerator {
    async fn generate(&self, _: StageType, _: &str, _: &str) -> Result<String, CallError> {
        self.store
            .write("novel", StageType::Premise, "a different premise")
            .map_err(|e| CallError::Transient(e.to_string()))?;
        Ok("treatment".into())
    }
}

#[tokio::test]
async fn dependency_changed_mid_generation_is_refused() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&[StageType::Premise]).await;

    let coordinator = StageCoordinator::new(
        h.root(),
        Arc::new(MeddlingGenerator {
            store: FsArtifactStore::new(h.root()),
        }),
        h.judge.clone(),
    )
    .with_settings(IterationConfig::default());

    let err = coordinator
        .iterate(request(StageType::Treatment))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::DependencyChanged {
            dependency: StageType::Premise,
            ..
        }
    ));
    assert_eq!(h.status(StageType::Treatment), StageStatus::Missing);
}

// ---------------------------------------------------------------------------
// Failed finalization
// ---------------------------------------------------------------------------

/// File store that refuses to delete one stage.
struct StubbornStore {
    inner: FsArtifactStore,
    keep: Mutex<Option<StageType>>,
}

impl ArtifactStore for StubbornStore {
    fn read(&self, project: &str, stage: StageType) -> stagecraft_core::Result<Stage> {
        self.inner.read(project, stage)
    }

    fn write(&self, project: &str, stage: StageType, content: &str) -> stagecraft_core::Result<Stage> {
        self.inner.write(project, stage, content)
    }

    fn set_status(
        &self,
        project: &str,
        stage: StageType,
        status: StageStatus,
    ) -> stagecraft_core::Result<Stage> {
        self.inner.set_status(project, stage, status)
    }

    fn put(&self, project: &str, stage: &Stage) -> stagecraft_core::Result<()> {
        self.inner.put(project, stage)
    }

    fn delete(&self, project: &str, stage: StageType) -> stagecraft_core::Result<()> {
        if *self.keep.lock().unwrap() == Some(stage) {
            return Err(StageError::StoreIo(std::io::Error::other("device busy")));
        }
        self.inner.delete(project, stage)
    }

    fn list(&self, project: &str) -> stagecraft_core::Result<BTreeSet<StageType>> {
        self.inner.list(project)
    }
}

#[tokio::test]
async fn failed_cascade_restores_every_touched_stage() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&HEAD).await;
    let commits = h.committer.commits();
    let premise = h.coordinator.store().read("novel", StageType::Premise).unwrap();
    let treatment = h.coordinator.store().read("novel", StageType::Treatment).unwrap();

    let store = Arc::new(StubbornStore {
        inner: FsArtifactStore::new(h.root()),
        keep: Mutex::new(Some(StageType::StructurePlan)),
    });
    let coordinator = StageCoordinator::new(h.root(), h.generator.clone(), h.judge.clone())
        .with_committer(h.committer.clone())
        .with_store(store.clone());

    let err = coordinator
        .iterate(request(StageType::Premise))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::StoreIo(_)));

    // Treatment was already culled when the cascade failed; it is back.
    assert_eq!(store.read("novel", StageType::Premise).unwrap(), premise);
    assert_eq!(store.read("novel", StageType::Treatment).unwrap(), treatment);
    assert_eq!(h.status(StageType::StructurePlan), StageStatus::Approved);
    let history = h.coordinator.history();
    assert_eq!(history.count("novel", StageType::Premise).unwrap(), 1);
    assert_eq!(history.count("novel", StageType::Treatment).unwrap(), 1);
    assert_eq!(h.committer.commits(), commits);

    *store.keep.lock().unwrap() = None;
    let outcome = coordinator
        .iterate(request(StageType::Premise))
        .await
        .unwrap();
    assert_eq!(outcome.version, Some(2));
    assert_eq!(outcome.cascaded, vec![StageType::Treatment, StageType::StructurePlan]);
}

/// Replaces the treatment's history log with a directory while generating.
struct LogClobberingGenerator {
    root: PathBuf,
}

#[async_trait]
impl ContentGenerator for LogClobberingGenerator {
    async fn generate(&self, _: StageType, _: &str, _: &str) -> Result<String, CallError> {
        let log = paths::history_path(&self.root, "novel", StageType::Treatment);
        std::fs::remove_file(&log).map_err(|e| CallError::Transient(e.to_string()))?;
        std::fs::create_dir_all(&log).map_err(|e| CallError::Transient(e.to_string()))?;
        Ok("treatment".into())
    }
}

#[tokio::test]
async fn unwritable_history_leaves_stage_and_downstream_untouched() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    h.seed(&HEAD).await;
    let commits = h.committer.commits();
    let before = h.coordinator.store().read("novel", StageType::Treatment).unwrap();

    let coordinator = StageCoordinator::new(
        h.root(),
        Arc::new(LogClobberingGenerator { root: h.root() }),
        h.judge.clone(),
    )
    .with_committer(h.committer.clone());

    coordinator
        .iterate(request(StageType::Treatment))
        .await
        .unwrap_err();

    let after = h.coordinator.store().read("novel", StageType::Treatment).unwrap();
    assert_eq!(after, before);
    assert_eq!(after.version, 1);
    assert_eq!(h.status(StageType::StructurePlan), StageStatus::Approved);
    assert_eq!(h.committer.commits(), commits);
}

// ---------------------------------------------------------------------------
// Waiting on other processes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finalize_waits_for_project_lock_held_elsewhere() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    let held = ProjectLock::acquire(&h.root(), "novel").unwrap();

    let release = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);
    };
    let (outcome, ()) = tokio::join!(h.coordinator.iterate(request(StageType::Premise)), release);

    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, IterationStatus::Approved);
    assert!(matches!(outcome.commit, CommitState::Committed { .. }));
    assert_eq!(h.status(StageType::Premise), StageStatus::Approved);
}

/// Committer that takes a while and records when it finished.
struct SlowCommitter {
    inner: SnapshotCommitter,
    finished: Mutex<Option<Instant>>,
}

impl VersionedCommitter for SlowCommitter {
    fn commit(&self, project: &str, message: &str) -> stagecraft_core::Result<VersionId> {
        std::thread::sleep(Duration::from_millis(300));
        let version = self.inner.commit(project, message);
        *self.finished.lock().unwrap() = Some(Instant::now());
        version
    }

    fn revert(&self, project: &str, version: &str) -> stagecraft_core::Result<()> {
        self.inner.revert(project, version)
    }

    fn history(&self, project: &str) -> stagecraft_core::Result<Vec<VersionEntry>> {
        self.inner.history(project)
    }
}

#[tokio::test]
async fn slow_commit_does_not_stall_other_tasks() {
    let h = Harness::new(ScriptedGenerator::new(vec![]), ScriptedJudge::approving());
    let committer = Arc::new(SlowCommitter {
        inner: SnapshotCommitter::new(h.root()),
        finished: Mutex::new(None),
    });
    let coordinator = StageCoordinator::new(h.root(), h.generator.clone(), h.judge.clone())
        .with_committer(committer.clone());

    let ticker = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Instant::now()
    };
    let (outcome, ticked) = tokio::join!(coordinator.iterate(request(StageType::Premise)), ticker);

    assert!(matches!(outcome.unwrap().commit, CommitState::Committed { .. }));
    let finished = *committer.finished.lock().unwrap();
    assert!(ticked < finished.unwrap());
}
