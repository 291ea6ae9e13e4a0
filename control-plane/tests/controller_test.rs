//! End-to-end controller tests: scripted planner, committing backend,
//! real git underneath.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use control_plane::error::ControlResult;
use control_plane::events::MissionEvent;
use control_plane::planner::{EpochPlan, PlanContext, Planner};
use control_plane::store::{StopReason, UnitState, WorkUnit};
use control_plane::worker::{ResultEnvelope, WorkerBackend, WorkerRequest};
use control_plane::{ContinuousController, MissionConfig};

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
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

fn base_config(source: &Path) -> MissionConfig {
    let mut config = MissionConfig::for_target(source);
    config.target.verification.command = "true".to_string();
    config.target.verification.timeout = 60;
    config.scheduler.parallel.num_workers = 2;
    config.scheduler.parallel.max_clones = Some(4);
    config.scheduler.session_timeout = 60;
    config.continuous.failure_backoff_seconds = 0;
    config.continuous.max_wall_time_seconds = 600;
    config.rounds.max_rounds = 6;
    config.rounds.stall_threshold = 2;
    config
}

/// Spec for one planned unit; `deps` index into the same epoch's units.
#[derive(Clone)]
struct UnitSpec {
    description: &'static str,
    file: &'static str,
    deps: Vec<usize>,
    ambition: f32,
}

fn spec(description: &'static str, file: &'static str, deps: Vec<usize>) -> UnitSpec {
    UnitSpec {
        description,
        file,
        deps,
        ambition: 8.0,
    }
}

/// Planner that serves a scripted sequence of epochs, then empty plans.
struct ScriptedPlanner {
    epochs: Mutex<VecDeque<Vec<UnitSpec>>>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    fn new(epochs: Vec<Vec<UnitSpec>>) -> Self {
        Self {
            epochs: Mutex::new(epochs.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn propose(&self, ctx: &PlanContext) -> ControlResult<EpochPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let specs = self.epochs.lock().unwrap().pop_front().unwrap_or_default();

        let ambition = specs.iter().map(|s| s.ambition).fold(10.0_f32, f32::min);
        let mut units: Vec<WorkUnit> = specs
            .iter()
            .map(|s| {
                let mut u = WorkUnit::new(&ctx.mission.id, s.description);
                u.files_hint = vec![s.file.to_string()];
                u
            })
            .collect();
        for (i, s) in specs.iter().enumerate() {
            let deps: Vec<String> = s.deps.iter().map(|&d| units[d].id.clone()).collect();
            units[i].depends_on = deps;
        }

        Ok(EpochPlan {
            units,
            ambition_score: ambition,
        })
    }
}

/// Backend that commits the unit's hinted file on the given branch.
struct CommittingBackend {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl CommittingBackend {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WorkerBackend for CommittingBackend {
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let file = request
            .unit
            .files_hint
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{}.txt", request.unit.id));
        std::fs::write(request.workspace.join(&file), "worker change\n").unwrap();
        git(&request.workspace, &["add", "."]);
        git(&request.workspace, &["commit", "-m", "unit change"]);

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ResultEnvelope::from_worker_output(
            &request.unit.id,
            0,
            &format!(
                "MC_RESULT_BEGIN\n{{\"status\":\"ok\",\"branch\":\"{}\",\"cost_usd\":0.5,\"files_changed\":[\"{file}\"]}}\nMC_RESULT_END\n",
                request.branch
            ),
        ))
    }
}

/// Backend whose workers always fail.
struct FailingBackend;

#[async_trait]
impl WorkerBackend for FailingBackend {
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope> {
        Ok(ResultEnvelope::failed(
            &request.unit.id,
            "worker_failed",
            "injected failure",
        ))
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<MissionEvent>) -> Vec<MissionEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_ordering_drives_two_green_advances() {
    let source = setup_source();
    let mut config = base_config(source.path());
    config.continuous.objective_check = Some("test -f b.txt".to_string());

    let planner = Box::new(ScriptedPlanner::new(vec![vec![
        spec("build part a", "a.txt", vec![]),
        spec("build part b", "b.txt", vec![0]),
    ]]));
    let backend = Arc::new(CommittingBackend::new(Duration::from_millis(10)));

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .unwrap();
    let mut rx = controller.events().subscribe();
    let outcome = controller.run("finish parts a and b").await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::ObjectiveMet);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.made_progress);

    let store = controller.store();
    let units = store.mission_units(&outcome.mission_id).unwrap();
    assert_eq!(units.len(), 2);
    let unit_a = units.iter().find(|u| u.description == "build part a").unwrap();
    let unit_b = units.iter().find(|u| u.description == "build part b").unwrap();
    assert_eq!(unit_a.state, UnitState::Completed);
    assert_eq!(unit_b.state, UnitState::Completed);

    let events = drain_events(&mut rx);
    let green_advances = events
        .iter()
        .filter(|e| matches!(e, MissionEvent::GreenAdvanced { .. }))
        .count();
    assert_eq!(green_advances, 2);

    // B is never dispatched while A is unfinished.
    let a_completed = events
        .iter()
        .position(|e| {
            matches!(e, MissionEvent::UnitCompleted { unit_id, .. } if unit_id == &unit_a.id)
        })
        .expect("a completed");
    let b_dispatched = events
        .iter()
        .position(|e| {
            matches!(e, MissionEvent::UnitDispatched { unit_id, .. } if unit_id == &unit_b.id)
        })
        .expect("b dispatched");
    assert!(a_completed < b_dispatched);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_total_failure_stops_mission() {
    let source = setup_source();
    let mut config = base_config(source.path());
    config.continuous.max_consecutive_failures = 3;
    config.rounds.stall_threshold = 100;
    config.rounds.max_rounds = 10;

    // One fresh unit per epoch, forever.
    let planner = Box::new(ScriptedPlanner::new(vec![
        vec![spec("attempt 1", "x.txt", vec![])],
        vec![spec("attempt 2", "y.txt", vec![])],
        vec![spec("attempt 3", "z.txt", vec![])],
        vec![spec("attempt 4", "w.txt", vec![])],
    ]));
    let backend = Arc::new(FailingBackend);

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .unwrap();
    let outcome = controller.run("doomed objective").await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::RepeatedTotalFailure);
    assert_eq!(outcome.exit_code, 1);
    assert!(!outcome.made_progress);
    assert_eq!(outcome.epochs_run, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn cost_budget_stops_mission_with_exit_code_two() {
    let source = setup_source();
    let mut config = base_config(source.path());
    // Each unit costs $0.50; three units cross a $1 budget.
    config.scheduler.budget.max_per_run_usd = 1.0;
    config.rounds.stall_threshold = 100;

    let planner = Box::new(ScriptedPlanner::new(vec![
        vec![spec("one", "one.txt", vec![])],
        vec![spec("two", "two.txt", vec![])],
        vec![spec("three", "three.txt", vec![])],
    ]));
    let backend = Arc::new(CommittingBackend::new(Duration::from_millis(10)));

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .unwrap();
    let outcome = controller.run("spend money").await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::CostBudget);
    assert_eq!(outcome.exit_code, 2);
    assert!(outcome.total_cost_usd >= 1.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_limit_resize_takes_effect_live() {
    let source = setup_source();
    let mut config = base_config(source.path());
    config.scheduler.parallel.num_workers = 1;
    config.continuous.objective_check = Some("test -f r3.txt".to_string());

    let planner = Box::new(ScriptedPlanner::new(vec![vec![
        spec("resize one", "r1.txt", vec![]),
        spec("resize two", "r2.txt", vec![]),
        spec("resize three", "r3.txt", vec![]),
    ]]));
    let backend = Arc::new(CommittingBackend::new(Duration::from_millis(1500)));
    let backend_probe = Arc::clone(&backend);

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .unwrap();

    // Grow the live limit shortly after dispatch begins; no restart.
    let limiter = controller.limiter();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        limiter.resize(3);
    });

    let outcome = controller.run("observe resize").await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::ObjectiveMet);

    let peak = backend_probe.peak.load(Ordering::SeqCst);
    assert!(peak >= 2, "resize never took effect, peak {peak}");
    assert!(peak <= 3, "live limit exceeded, peak {peak}");
}

#[tokio::test(flavor = "multi_thread")]
async fn low_ambition_plans_trigger_replans() {
    let source = setup_source();
    let mut config = base_config(source.path());
    config.continuous.min_ambition_score = 5.0;
    config.continuous.max_replan_attempts = 2;
    config.continuous.objective_check = Some("test -f ok.txt".to_string());

    let mut weak = spec("weak plan", "ok.txt", vec![]);
    weak.ambition = 1.0;
    let strong = spec("strong plan", "ok.txt", vec![]);

    let planner = ScriptedPlanner::new(vec![vec![weak], vec![strong]]);
    let calls_probe = Arc::new(planner);
    // Box a forwarding planner so we keep the call counter.
    struct Forward(Arc<ScriptedPlanner>);
    #[async_trait]
    impl Planner for Forward {
        async fn propose(&self, ctx: &PlanContext) -> ControlResult<EpochPlan> {
            self.0.propose(ctx).await
        }
    }

    let backend = Arc::new(CommittingBackend::new(Duration::from_millis(10)));
    let mut controller = ContinuousController::bootstrap(
        config,
        Box::new(Forward(Arc::clone(&calls_probe))),
        backend,
    )
    .await
    .unwrap();
    let outcome = controller.run("replan until ambitious").await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::ObjectiveMet);
    // First proposal was rejected by the ambition gate, second accepted.
    assert!(calls_probe.calls.load(Ordering::SeqCst) >= 2);

    let units = controller.store().mission_units(&outcome.mission_id).unwrap();
    let dispatched: Vec<_> = units
        .iter()
        .filter(|u| u.state == UnitState::Completed)
        .collect();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].description, "strong plan");
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_mission_stops_with_exit_code_one() {
    let source = setup_source();
    let mut config = base_config(source.path());
    config.rounds.stall_threshold = 2;

    // Planner never produces units: green never advances.
    let planner = Box::new(ScriptedPlanner::new(vec![]));
    let backend = Arc::new(CommittingBackend::new(Duration::from_millis(10)));

    let mut controller = ContinuousController::bootstrap(config, planner, backend)
        .await
        .unwrap();
    let outcome = controller.run("nothing to do").await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Stalled);
    assert_eq!(outcome.exit_code, 1);
    assert!(!outcome.made_progress);
}
