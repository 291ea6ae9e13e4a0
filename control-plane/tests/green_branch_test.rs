//! Green-branch pipeline tests against real git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use control_plane::breaker::CircuitBreakerSet;
use control_plane::config::{GreenBranchConfig, VerificationConfig};
use control_plane::error::ControlResult;
use control_plane::green::{GreenBranchManager, ProcessOutcome, GREEN_BRANCH};
use control_plane::queue::MergeSubmission;
use control_plane::store::{UnitState, WorkUnit};
use control_plane::worker::{ResultEnvelope, WorkerBackend, WorkerRequest};
use control_plane::workspace::{WorkspaceHandle, WorkspacePool};

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn setup_source() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# target\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

/// Backend that never produces a viable candidate; used where fixup must
/// come up empty.
struct DeadBackend;

#[async_trait]
impl WorkerBackend for DeadBackend {
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope> {
        Ok(ResultEnvelope::failed(
            &request.unit.id,
            "worker_failed",
            "no candidate",
        ))
    }
}

/// Backend that commits a clean fix in its workspace, for fixup rounds.
struct FixingBackend {
    file: String,
}

#[async_trait]
impl WorkerBackend for FixingBackend {
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope> {
        std::fs::write(request.workspace.join(&self.file), "fixed\n").unwrap();
        git(&request.workspace, &["add", "."]);
        git(&request.workspace, &["commit", "-m", "fixup candidate"]);
        let mut env = ResultEnvelope::from_worker_output(
            &request.unit.id,
            0,
            &format!(
                "MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{}\",\"cost_usd\":0.2,\"tests_passed\":5}}\nMC_RESULT_END\n",
                request.branch
            ),
        );
        env.unit_id = request.unit.id.clone();
        Ok(env)
    }
}

struct Harness {
    _source: TempDir,
    _state: TempDir,
    source_path: PathBuf,
    pool: WorkspacePool,
    manager: GreenBranchManager,
}

async fn setup(
    backend: Arc<dyn WorkerBackend>,
    verification_command: &str,
    green_cfg: GreenBranchConfig,
) -> Harness {
    let source = setup_source();
    let state = TempDir::new().unwrap();
    let source_path = source.path().to_path_buf();

    let pool = WorkspacePool::provision(&source_path, state.path().join("pool"), "main", 4)
        .await
        .unwrap();
    let breakers = Arc::new(CircuitBreakerSet::new(3, Duration::from_secs(60)));
    let verification = VerificationConfig {
        command: verification_command.to_string(),
        timeout: 60,
    };
    let manager = GreenBranchManager::provision(
        &source_path,
        state.path(),
        "main",
        pool.clone(),
        backend,
        breakers,
        green_cfg,
        verification,
        true,
        Duration::from_secs(60),
        1.0,
    )
    .await
    .unwrap();

    Harness {
        _source: source,
        _state: state,
        source_path,
        pool,
        manager,
    }
}

/// Commit `file` on a fresh worker branch in a pool clone and wrap it as
/// a merge submission.
async fn worker_submission(harness: &Harness, unit: &WorkUnit, file: &str) -> MergeSubmission {
    let ws: WorkspaceHandle = harness
        .pool
        .acquire(Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    let branch = format!("mc/unit/{}-a{}", unit.id, unit.attempt_count);
    git(ws.path(), &["checkout", "-b", &branch]);
    std::fs::write(ws.path().join(file), "worker output\n").unwrap();
    git(ws.path(), &["add", "."]);
    git(ws.path(), &["commit", "-m", "worker change"]);

    let envelope = ResultEnvelope::from_worker_output(
        &unit.id,
        0,
        &format!(
            "MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{branch}\",\"cost_usd\":0.5,\"files_changed\":[\"{file}\"]}}\nMC_RESULT_END\n"
        ),
    );
    MergeSubmission::new(branch, envelope, ws)
}

#[tokio::test]
async fn promotes_clean_merge_to_green() {
    let harness = setup(Arc::new(DeadBackend), "true", GreenBranchConfig::default()).await;
    let green_before = harness.manager.green_sha().await.unwrap();

    let mut unit = WorkUnit::new("m-1", "add feature file");
    unit.begin_attempt("e-1");
    let submission = worker_submission(&harness, &unit, "feature.txt").await;

    let result = harness
        .manager
        .process(submission, &mut unit, "objective")
        .await
        .unwrap();

    match result.outcome {
        ProcessOutcome::Completed {
            green_sha,
            changed_files,
            ..
        } => {
            assert_ne!(green_sha, green_before);
            assert!(changed_files.contains(&"feature.txt".to_string()));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(unit.state, UnitState::Completed);

    // Green advanced by fast-forward and still trails working.
    let green = harness.manager.green_sha().await.unwrap();
    let working = harness.manager.working_sha().await.unwrap();
    assert_eq!(green, working);
    assert!(harness
        .manager
        .git()
        .is_ancestor(&green_before, &green)
        .await
        .unwrap());

    // Promotion synced mc/green back into the source repository.
    let source_green = git(&harness.source_path, &["rev-parse", GREEN_BRANCH]);
    assert_eq!(source_green, green);
}

#[tokio::test]
async fn verification_failure_rolls_back_working() {
    let mut cfg = GreenBranchConfig::default();
    cfg.fixup_max_attempts = 0;
    // The unit's change trips the verification command after merge.
    let harness = setup(Arc::new(DeadBackend), "test ! -f break.txt", cfg).await;

    let green_before = harness.manager.green_sha().await.unwrap();
    let working_before = harness.manager.working_sha().await.unwrap();

    let mut unit = WorkUnit::new("m-1", "introduce a regression");
    unit.begin_attempt("e-1");
    let submission = worker_submission(&harness, &unit, "break.txt").await;

    let result = harness
        .manager
        .process(submission, &mut unit, "objective")
        .await
        .unwrap();

    assert!(matches!(result.outcome, ProcessOutcome::Rejected { .. }));
    // Clean rollback: mc/working back to the pre-merge sha, green untouched.
    assert_eq!(harness.manager.working_sha().await.unwrap(), working_before);
    assert_eq!(harness.manager.green_sha().await.unwrap(), green_before);
    assert!(!harness
        .manager
        .git()
        .dir()
        .join("break.txt")
        .exists());
    assert!(unit.last_failure_reason.unwrap().contains("verification"));
}

#[tokio::test]
async fn acceptance_criterion_failure_rolls_back() {
    let mut cfg = GreenBranchConfig::default();
    cfg.fixup_max_attempts = 0;
    let harness = setup(Arc::new(DeadBackend), "true", cfg).await;
    let working_before = harness.manager.working_sha().await.unwrap();

    let mut unit = WorkUnit::new("m-1", "unit with failing criterion");
    unit.acceptance_criteria = vec!["true".to_string(), "false".to_string()];
    unit.begin_attempt("e-1");
    let submission = worker_submission(&harness, &unit, "whatever.txt").await;

    let result = harness
        .manager
        .process(submission, &mut unit, "objective")
        .await
        .unwrap();

    match result.outcome {
        ProcessOutcome::Rejected { reason } => assert!(reason.contains("acceptance")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(harness.manager.working_sha().await.unwrap(), working_before);
}

#[tokio::test]
async fn resubmitting_promoted_branch_is_idempotent() {
    let harness = setup(Arc::new(DeadBackend), "true", GreenBranchConfig::default()).await;

    let mut unit = WorkUnit::new("m-1", "idempotent unit");
    unit.begin_attempt("e-1");

    let submission = worker_submission(&harness, &unit, "once.txt").await;
    let branch = submission.branch_ref.clone();
    let result = harness
        .manager
        .process(submission, &mut unit, "objective")
        .await
        .unwrap();
    assert!(matches!(result.outcome, ProcessOutcome::Completed { .. }));
    let green_after_first = harness.manager.green_sha().await.unwrap();

    // Same branch again, fetched from a fresh clone of the now-synced
    // source. The manager must recognise it as already integrated.
    let ws = harness
        .pool
        .acquire(Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    git(ws.path(), &["checkout", "-b", &branch]);
    let envelope = ResultEnvelope::from_worker_output(
        &unit.id,
        0,
        &format!(
            "MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{branch}\",\"cost_usd\":0.0}}\nMC_RESULT_END\n"
        ),
    );
    let resubmission = MergeSubmission::new(branch, envelope, ws);

    let result = harness
        .manager
        .process(resubmission, &mut unit, "objective")
        .await
        .unwrap();
    assert!(matches!(result.outcome, ProcessOutcome::AlreadyIntegrated));
    assert_eq!(unit.state, UnitState::Completed);
    assert_eq!(harness.manager.green_sha().await.unwrap(), green_after_first);
}

#[tokio::test]
async fn fixup_rescues_failed_verification() {
    let mut cfg = GreenBranchConfig::default();
    cfg.fixup_max_attempts = 1;
    cfg.fixup_candidates = 2;
    let backend = Arc::new(FixingBackend {
        file: "fix.txt".to_string(),
    });
    // break.txt fails verification; the fixup candidates commit fix.txt
    // instead, which passes.
    let harness = setup(backend, "test ! -f break.txt", cfg).await;
    let green_before = harness.manager.green_sha().await.unwrap();

    let mut unit = WorkUnit::new("m-1", "unit that needs fixing");
    unit.begin_attempt("e-1");
    let submission = worker_submission(&harness, &unit, "break.txt").await;

    let result = harness
        .manager
        .process(submission, &mut unit, "objective")
        .await
        .unwrap();

    match result.outcome {
        ProcessOutcome::Completed { green_sha, .. } => {
            assert_ne!(green_sha, green_before);
        }
        other => panic!("expected fixup completion, got {other:?}"),
    }
    // Original attempt plus one fixup round.
    assert_eq!(unit.attempt_count, 2);
    assert_eq!(unit.state, UnitState::Completed);
    // Fixup candidates cost money too.
    assert!(result.fixup_cost_usd > 0.0);
}

#[tokio::test]
async fn merge_conflict_without_fixup_rejects() {
    let mut cfg = GreenBranchConfig::default();
    cfg.fixup_max_attempts = 0;
    let harness = setup(Arc::new(DeadBackend), "true", cfg).await;

    // First unit rewrites README and is promoted.
    let mut first = WorkUnit::new("m-1", "rewrite readme");
    first.begin_attempt("e-1");
    let ws = harness
        .pool
        .acquire(Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    let branch = format!("mc/unit/{}-a1", first.id);
    git(ws.path(), &["checkout", "-b", &branch]);
    std::fs::write(ws.path().join("README.md"), "# rewritten by first\n").unwrap();
    git(ws.path(), &["add", "."]);
    git(ws.path(), &["commit", "-m", "first rewrite"]);
    let envelope = ResultEnvelope::from_worker_output(
        &first.id,
        0,
        &format!("MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{branch}\"}}\nMC_RESULT_END\n"),
    );
    let result = harness
        .manager
        .process(MergeSubmission::new(branch, envelope, ws), &mut first, "obj")
        .await
        .unwrap();
    assert!(matches!(result.outcome, ProcessOutcome::Completed { .. }));

    // Second unit edits the same line from the stale base: conflict.
    let working_before = harness.manager.working_sha().await.unwrap();
    let mut second = WorkUnit::new("m-1", "conflicting rewrite");
    second.begin_attempt("e-1");
    let ws = harness
        .pool
        .acquire(Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    // Reset this clone to the original base so the edit conflicts.
    git(ws.path(), &["fetch", "origin", "main"]);
    git(ws.path(), &["checkout", "--detach", "origin/main"]);
    let branch = format!("mc/unit/{}-a1", second.id);
    git(ws.path(), &["checkout", "-b", &branch]);
    std::fs::write(ws.path().join("README.md"), "# rewritten by second\n").unwrap();
    git(ws.path(), &["add", "."]);
    git(ws.path(), &["commit", "-m", "second rewrite"]);
    let envelope = ResultEnvelope::from_worker_output(
        &second.id,
        0,
        &format!("MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{branch}\"}}\nMC_RESULT_END\n"),
    );

    let result = harness
        .manager
        .process(
            MergeSubmission::new(branch, envelope, ws),
            &mut second,
            "obj",
        )
        .await
        .unwrap();

    match result.outcome {
        ProcessOutcome::Rejected { reason } => assert!(reason.contains("conflict")),
        other => panic!("expected conflict rejection, got {other:?}"),
    }
    // Working tree rolled back cleanly after the aborted merge.
    assert_eq!(harness.manager.working_sha().await.unwrap(), working_before);
    let status = git(harness.manager.git().dir(), &["status", "--porcelain"]);
    assert!(status.is_empty(), "leftover residue: {status}");
}
