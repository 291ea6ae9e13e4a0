//! The continuous controller: the top-level epoch loop.
//!
//! Each epoch: plan, gate the plan's ambition, dispatch units in
//! dependency waves with file-overlap exclusion, drain worker results
//! through the merge queue into the green-branch manager, feed outcomes
//! back into the budget tracker and breakers, then check stop
//! conditions. The loop ends on wall time, cost, repeated total failure,
//! stall, or a met objective.

pub mod dispatch;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::breaker::{CircuitBreakerSet, Outcome, COMPONENT_PLANNER, COMPONENT_WORKER};
use crate::budget::EmaBudget;
use crate::changelog::MissionChangelog;
use crate::config::MissionConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{EventBus, MissionEvent, SharedEventBus};
use crate::green::{GreenBranchManager, ProcessOutcome};
use crate::limits::WorkerLimiter;
use crate::planner::{EpochPlan, PlanContext, Planner};
use crate::queue::{MergeQueue, MergeQueueConsumer, MergeSubmission};
use crate::review::DiffReviewer;
use crate::store::{
    Epoch, Mission, MissionStore, Reflection, SharedStore, StopReason, UnitState, WorkUnit,
};
use crate::verify::CheckRunner;
use crate::worker::{ResultEnvelope, WorkerBackend, WorkerRequest};
use crate::workspace::WorkspacePool;

use dispatch::{has_cycle, schedule_waves, staleness, strip_cycles};

/// Base inter-epoch cooldown, doubled under budget pressure.
const EPOCH_COOLDOWN_SECS: u64 = 2;

/// How long a dispatch waits for a free clone before failing the unit.
const CLONE_WAIT_SECS: u64 = 60;

/// Per-item drain allowance on top of already-finished workers.
const DRAIN_PER_ITEM_SECS: u64 = 5;

/// Final state of a mission run.
#[derive(Debug, Clone)]
pub struct MissionOutcome {
    pub mission_id: String,
    pub stop_reason: StopReason,
    pub made_progress: bool,
    pub total_cost_usd: f64,
    pub epochs_run: u32,
    pub exit_code: i32,
}

struct DispatchTaskResult {
    unit_id: String,
    submitted: bool,
    cost_usd: f64,
    failure: Option<String>,
    workspace: Option<PathBuf>,
}

/// Top-level driver for one mission.
pub struct ContinuousController {
    config: MissionConfig,
    store: SharedStore,
    pool: WorkspacePool,
    limiter: WorkerLimiter,
    breakers: Arc<CircuitBreakerSet>,
    backend: Arc<dyn WorkerBackend>,
    planner: Box<dyn Planner>,
    green: GreenBranchManager,
    reviewer: Arc<DiffReviewer>,
    events: SharedEventBus,
    changelog: MissionChangelog,
}

impl ContinuousController {
    /// Provision every component from configuration.
    pub async fn bootstrap(
        config: MissionConfig,
        planner: Box<dyn Planner>,
        backend: Arc<dyn WorkerBackend>,
    ) -> ControlResult<Self> {
        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir)?;

        let store = MissionStore::open(state_dir.join("db"))?.shared();
        let events = EventBus::with_persistence(store.clone()).shared();
        let breakers = Arc::new(CircuitBreakerSet::new(
            config.degradation.failure_threshold,
            Duration::from_secs(config.degradation.reset_timeout),
        ));
        let pool = WorkspacePool::provision(
            &config.target.path,
            config.pool_dir(),
            &config.target.branch,
            config.max_clones(),
        )
        .await?;
        let green = GreenBranchManager::provision(
            &config.target.path,
            &state_dir,
            &config.target.branch,
            pool.clone(),
            Arc::clone(&backend),
            Arc::clone(&breakers),
            config.green_branch.clone(),
            config.target.verification.clone(),
            config.continuous.verify_before_merge,
            Duration::from_secs(config.scheduler.session_timeout),
            config.scheduler.budget.max_per_session_usd,
        )
        .await?;
        let reviewer = Arc::new(DiffReviewer::new(
            config.review.command.clone(),
            Duration::from_secs(config.review.timeout),
            store.clone(),
        ));
        let limiter = WorkerLimiter::new(config.scheduler.parallel.num_workers);
        let changelog = MissionChangelog::new(state_dir.join("changelog.log"));

        Ok(Self {
            config,
            store,
            pool,
            limiter,
            breakers,
            backend,
            planner,
            green,
            reviewer,
            events,
            changelog,
        })
    }

    /// Direct wiring, used by tests that provision components themselves.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MissionConfig,
        store: SharedStore,
        pool: WorkspacePool,
        limiter: WorkerLimiter,
        breakers: Arc<CircuitBreakerSet>,
        backend: Arc<dyn WorkerBackend>,
        planner: Box<dyn Planner>,
        green: GreenBranchManager,
        reviewer: Arc<DiffReviewer>,
        events: SharedEventBus,
        changelog: MissionChangelog,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            limiter,
            breakers,
            backend,
            planner,
            green,
            reviewer,
            events,
            changelog,
        }
    }

    /// Live worker limit handle; resizing takes effect at the next
    /// dispatch step without a restart.
    pub fn limiter(&self) -> WorkerLimiter {
        self.limiter.clone()
    }

    /// Event bus handle for observers.
    pub fn events(&self) -> SharedEventBus {
        Arc::clone(&self.events)
    }

    /// Store handle, for dashboards and status probes.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Run a mission to a terminal state.
    pub async fn run(&mut self, objective: &str) -> ControlResult<MissionOutcome> {
        let mut mission = Mission::new(
            objective,
            self.config.target.verification.command.clone(),
            self.config.scheduler.budget.max_per_run_usd,
            self.config.continuous.max_wall_time_seconds,
        );
        self.store.put_mission(&mission)?;
        self.changelog.log_mission_start(&mission.id, objective)?;
        self.events.publish(MissionEvent::MissionStarted {
            mission_id: mission.id.clone(),
            objective: objective.to_string(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let wall_budget = Duration::from_secs(mission.wall_time_budget_secs);
        let (queue, mut consumer) = MergeQueue::channel();

        let mut budget = EmaBudget::new();
        let mut consecutive_all_fail = 0u32;
        let mut stall_epochs = 0u32;
        let mut merged_files: HashSet<String> = HashSet::new();
        let mut stale_context: Vec<String> = Vec::new();
        let mut made_progress = false;
        let mut epochs_run = 0u32;

        let stop_reason = 'mission: loop {
            let ordinal = epochs_run;
            if ordinal >= self.config.rounds.max_rounds {
                break StopReason::TimeBudget;
            }
            if started.elapsed() >= wall_budget {
                break StopReason::TimeBudget;
            }
            if mission.total_cost_usd >= mission.budget_usd {
                break StopReason::CostBudget;
            }

            // Plan, with replans for cycles and weak ambition.
            let plan = match self.plan_epoch(&mission, ordinal, &stale_context).await {
                Ok(plan) => plan,
                Err(e) => {
                    error!(error = %e, "planning failed");
                    self.changelog
                        .log_failure("-", "planner", &e.to_string(), None)?;
                    if !self.breakers.allow(COMPONENT_PLANNER) {
                        break StopReason::Internal;
                    }
                    tokio::time::sleep(Duration::from_secs(
                        self.config.continuous.failure_backoff_seconds,
                    ))
                    .await;
                    epochs_run += 1;
                    continue;
                }
            };
            stale_context.clear();

            let mut epoch = Epoch::new(&mission.id, ordinal, plan.ambition_score);
            let mut units: HashMap<String, WorkUnit> = HashMap::new();

            // Staleness gate before anything dispatches.
            let mut live_units: Vec<WorkUnit> = Vec::new();
            for mut unit in plan.units {
                epoch.planned_unit_ids.push(unit.id.clone());
                if let Some(reason) = staleness(
                    &unit,
                    Utc::now(),
                    self.config.continuous.backlog_max_age_seconds,
                    &merged_files,
                ) {
                    info!(unit_id = %unit.id, %reason, "dropping stale unit");
                    self.changelog.log_stale(&unit.id, &reason.to_string())?;
                    stale_context.push(unit.description.clone());
                    unit.record_failure(UnitState::Stale, reason.to_string());
                    self.store.put_unit(&unit)?;
                } else {
                    live_units.push(unit);
                }
            }

            self.changelog
                .log_epoch_start(ordinal, live_units.len())?;
            self.events.publish(MissionEvent::EpochStarted {
                mission_id: mission.id.clone(),
                ordinal,
                planned_units: live_units.len(),
                ambition_score: epoch.ambition_score,
                timestamp: Utc::now(),
            });

            let max_parallel = self.pool.total_slots().saturating_sub(1).max(1);
            let waves = schedule_waves(&live_units, max_parallel);
            for unit in live_units {
                units.insert(unit.id.clone(), unit);
            }

            let green_at_epoch_start = self.green.green_sha().await?;
            let cost_at_epoch_start = mission.total_cost_usd;
            let mut merged_count = 0u32;
            let mut failed_count = 0u32;

            for wave in waves {
                if started.elapsed() >= wall_budget {
                    break;
                }
                let (submitted, failures) = self
                    .dispatch_wave(&mission, &epoch, &wave, &mut units, &queue)
                    .await;

                for failure in failures {
                    failed_count += 1;
                    budget.record(failure.cost_usd);
                    mission.total_cost_usd += failure.cost_usd;
                    if let Some(unit) = units.get_mut(&failure.unit_id) {
                        unit.record_failure(
                            UnitState::Rejected,
                            failure.failure.clone().unwrap_or_default(),
                        );
                        self.store.put_unit(unit)?;
                    }
                    self.changelog.log_failure(
                        &failure.unit_id,
                        "worker",
                        failure.failure.as_deref().unwrap_or("worker failed"),
                        failure.workspace.as_deref(),
                    )?;
                }

                let (wave_merged, wave_failed) = self
                    .drain_and_integrate(
                        &mut mission,
                        &mut consumer,
                        submitted,
                        &mut units,
                        &mut budget,
                        &mut merged_files,
                    )
                    .await?;
                merged_count += wave_merged;
                failed_count += wave_failed;
                if wave_merged > 0 {
                    made_progress = true;
                }
            }

            // Feedback: persist the epoch, reflect, and re-arm counters.
            epoch.dispatched_unit_ids = units
                .values()
                .filter(|u| u.attempt_count > 0)
                .map(|u| u.id.clone())
                .collect();
            let dispatched = epoch.dispatched_unit_ids.len();
            epoch.all_failed = dispatched > 0 && merged_count == 0;
            epoch.cost_usd = mission.total_cost_usd - cost_at_epoch_start;
            epoch.ended_at = Some(Utc::now());
            self.store.put_epoch(&epoch)?;
            self.store.put_mission(&mission)?;

            let green_now = self.green.green_sha().await?;
            let mut reflection = Reflection::new(&mission.id, ordinal);
            reflection.merged_units = merged_count;
            reflection.failed_units = failed_count;
            reflection.green_sha = Some(green_now.clone());
            reflection.cost_usd = mission.total_cost_usd;
            reflection.summary = format!(
                "epoch {ordinal}: {merged_count} merged, {failed_count} failed, green at {}",
                &green_now[..8.min(green_now.len())]
            );
            self.store.put_reflection(&reflection)?;

            self.events.publish(MissionEvent::EpochEnded {
                mission_id: mission.id.clone(),
                ordinal,
                merged_units: merged_count,
                failed_units: failed_count,
                cost_usd: mission.total_cost_usd,
                timestamp: Utc::now(),
            });
            epochs_run += 1;

            // Stop-condition ladder, in order.
            if started.elapsed() >= wall_budget {
                break StopReason::TimeBudget;
            }
            if mission.total_cost_usd >= mission.budget_usd {
                break StopReason::CostBudget;
            }
            if epoch.all_failed {
                consecutive_all_fail += 1;
                if consecutive_all_fail >= self.config.continuous.max_consecutive_failures {
                    break StopReason::RepeatedTotalFailure;
                }
                info!(
                    consecutive_all_fail,
                    backoff = self.config.continuous.failure_backoff_seconds,
                    "every unit failed this epoch; backing off"
                );
                tokio::time::sleep(Duration::from_secs(
                    self.config.continuous.failure_backoff_seconds,
                ))
                .await;
            } else {
                consecutive_all_fail = 0;
            }

            if green_now == green_at_epoch_start {
                stall_epochs += 1;
                if stall_epochs >= self.config.rounds.stall_threshold {
                    break StopReason::Stalled;
                }
            } else {
                stall_epochs = 0;
            }

            if merged_count > 0 {
                if let Some(check) = self.config.continuous.objective_check.clone() {
                    let outcome = CheckRunner::new(self.green.git().dir())
                        .run_check(
                            "objective",
                            &check,
                            Duration::from_secs(self.config.target.verification.timeout),
                        )
                        .await?;
                    if outcome.passed {
                        break 'mission StopReason::ObjectiveMet;
                    }
                }
            }

            if !epoch.all_failed {
                let cooldown = budget.cooldown_secs(
                    EPOCH_COOLDOWN_SECS,
                    mission.total_cost_usd,
                    mission.budget_usd,
                    self.config.continuous.max_units_per_epoch,
                );
                tokio::time::sleep(Duration::from_secs(cooldown)).await;
            }
        };

        self.finish(mission, stop_reason, made_progress, epochs_run).await
    }

    /// Ask the planner for an epoch, replanning on cycles and weak
    /// ambition up to `max_replan_attempts`, then accepting what stands.
    async fn plan_epoch(
        &self,
        mission: &Mission,
        ordinal: u32,
        stale_context: &[String],
    ) -> ControlResult<EpochPlan> {
        let mut feedback: Option<String> = None;
        let mut replans = 0u32;

        loop {
            if !self.breakers.allow(COMPONENT_PLANNER) {
                return Err(ControlError::Planner("planner circuit open".to_string()));
            }

            let mut context_notes = stale_context.to_vec();
            context_notes.extend(self.review_hints(&mission.id)?);

            let ctx = PlanContext {
                mission: mission.clone(),
                epoch_ordinal: ordinal,
                max_units: self.config.continuous.max_units_per_epoch,
                reflections: self.store.mission_reflections(&mission.id)?,
                backlog: self.store.list_backlog()?,
                stale_context: context_notes,
                rejection_feedback: feedback.clone(),
            };

            let mut plan = match self.planner.propose(&ctx).await {
                Ok(plan) => {
                    self.breakers.record(COMPONENT_PLANNER, Outcome::Success);
                    plan
                }
                Err(e) => {
                    self.breakers.record(COMPONENT_PLANNER, Outcome::Failure);
                    return Err(e);
                }
            };
            plan.units
                .truncate(self.config.continuous.max_units_per_epoch);

            if has_cycle(&plan.units) {
                if replans < self.config.continuous.max_replan_attempts {
                    replans += 1;
                    feedback = Some("plan contains a dependency cycle".to_string());
                    warn!(ordinal, "cyclic plan, requesting replan");
                    continue;
                }
                let (kept, dropped) = strip_cycles(plan.units);
                warn!(?dropped, "dropping cyclic units after replans exhausted");
                plan.units = kept;
            }

            if plan.ambition_score < self.config.continuous.min_ambition_score
                && replans < self.config.continuous.max_replan_attempts
            {
                replans += 1;
                feedback = Some(format!(
                    "ambition {:.1} below threshold {:.1}",
                    plan.ambition_score, self.config.continuous.min_ambition_score
                ));
                info!(
                    ordinal,
                    ambition = plan.ambition_score,
                    "plan below ambition gate, requesting replan"
                );
                continue;
            }

            return Ok(plan);
        }
    }

    /// Low-review notes fed back to the planner when review gating is on.
    fn review_hints(&self, mission_id: &str) -> ControlResult<Vec<String>> {
        if !self.config.review.gate_completion {
            return Ok(Vec::new());
        }
        let mut hints = Vec::new();
        for unit in self.store.mission_units(mission_id)? {
            if unit.state != UnitState::Completed {
                continue;
            }
            if let Some(review) = self.store.get_review(&unit.id)? {
                if review.parsed && review.aggregate() < self.config.review.min_review_score {
                    hints.push(format!(
                        "merged unit `{}` scored {:.1} in review: {}",
                        unit.description,
                        review.aggregate(),
                        review.notes
                    ));
                }
            }
        }
        Ok(hints)
    }

    /// Dispatch one wave concurrently. Returns the number of submissions
    /// sent to the merge queue and the per-unit failures.
    async fn dispatch_wave(
        &self,
        mission: &Mission,
        epoch: &Epoch,
        wave: &[String],
        units: &mut HashMap<String, WorkUnit>,
        queue: &MergeQueue,
    ) -> (usize, Vec<DispatchTaskResult>) {
        let mut tasks: JoinSet<DispatchTaskResult> = JoinSet::new();
        let mut failures: Vec<DispatchTaskResult> = Vec::new();

        for unit_id in wave {
            let Some(unit) = units.get_mut(unit_id) else {
                continue;
            };

            if !self.breakers.allow(COMPONENT_WORKER) {
                failures.push(DispatchTaskResult {
                    unit_id: unit_id.clone(),
                    submitted: false,
                    cost_usd: 0.0,
                    failure: Some("worker circuit open".to_string()),
                    workspace: None,
                });
                continue;
            }

            // The live limit: read at every dispatch, never captured.
            let permit = self.limiter.acquire().await;

            let workspace = match self.pool.acquire(Duration::from_secs(CLONE_WAIT_SECS)).await {
                Ok(Some(ws)) => ws,
                Ok(None) => {
                    failures.push(DispatchTaskResult {
                        unit_id: unit_id.clone(),
                        submitted: false,
                        cost_usd: 0.0,
                        failure: Some("no workspace clone available".to_string()),
                        workspace: None,
                    });
                    continue;
                }
                Err(e) => {
                    failures.push(DispatchTaskResult {
                        unit_id: unit_id.clone(),
                        submitted: false,
                        cost_usd: 0.0,
                        failure: Some(e.to_string()),
                        workspace: None,
                    });
                    continue;
                }
            };

            let branch = format!("mc/unit/{}-a{}", unit.id, unit.attempt_count + 1);
            if let Err(e) = workspace.git().run(&["checkout", "-b", &branch]).await {
                failures.push(DispatchTaskResult {
                    unit_id: unit_id.clone(),
                    submitted: false,
                    cost_usd: 0.0,
                    failure: Some(format!("branch setup failed: {e}")),
                    workspace: Some(workspace.path().to_path_buf()),
                });
                continue;
            }

            unit.begin_attempt(&epoch.id);
            if let Err(e) = self.store.put_unit(unit) {
                warn!(unit_id = %unit.id, error = %e, "failed to persist dispatch");
            }
            self.events.publish(MissionEvent::UnitDispatched {
                mission_id: mission.id.clone(),
                unit_id: unit.id.clone(),
                epoch_ordinal: epoch.ordinal,
                attempt: unit.attempt_count,
                timestamp: Utc::now(),
            });

            let request = WorkerRequest {
                unit: unit.clone(),
                workspace: workspace.path().to_path_buf(),
                branch: branch.clone(),
                objective: mission.objective.clone(),
                attempt: unit.attempt_count,
                session_budget_usd: self.config.scheduler.budget.max_per_session_usd,
                timeout: Duration::from_secs(self.config.scheduler.session_timeout),
                fixup_variant: None,
                failure_context: None,
            };

            let backend = Arc::clone(&self.backend);
            let breakers = Arc::clone(&self.breakers);
            let queue = queue.clone();
            let task_unit_id = unit.id.clone();
            tasks.spawn(async move {
                let ws_path = workspace.path().to_path_buf();
                let result = backend.run(&request).await;
                drop(permit);

                match result {
                    Ok(envelope) if envelope.succeeded() => {
                        breakers.record(COMPONENT_WORKER, Outcome::Success);
                        let reported = envelope.branch.clone().unwrap_or(branch);
                        let submission = MergeSubmission::new(reported, envelope, workspace);
                        match queue.submit(submission) {
                            Ok(()) => DispatchTaskResult {
                                unit_id: task_unit_id,
                                submitted: true,
                                cost_usd: 0.0,
                                failure: None,
                                workspace: Some(ws_path),
                            },
                            Err(e) => DispatchTaskResult {
                                unit_id: task_unit_id,
                                submitted: false,
                                cost_usd: 0.0,
                                failure: Some(e.to_string()),
                                workspace: Some(ws_path),
                            },
                        }
                    }
                    Ok(envelope) => {
                        breakers.record(COMPONENT_WORKER, Outcome::Failure);
                        DispatchTaskResult {
                            unit_id: task_unit_id,
                            submitted: false,
                            cost_usd: envelope.cost_usd,
                            failure: Some(describe_envelope_failure(&envelope)),
                            workspace: Some(ws_path),
                        }
                    }
                    Err(e) => {
                        breakers.record(COMPONENT_WORKER, Outcome::Failure);
                        DispatchTaskResult {
                            unit_id: task_unit_id,
                            submitted: false,
                            cost_usd: 0.0,
                            failure: Some(e.to_string()),
                            workspace: Some(ws_path),
                        }
                    }
                }
            });
        }

        let mut submitted = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) if result.submitted => submitted += 1,
                Ok(result) => failures.push(result),
                Err(e) => error!(error = %e, "dispatch task panicked"),
            }
        }
        (submitted, failures)
    }

    /// Drain the merge queue and push each submission through the
    /// green-branch pipeline, in submission order.
    async fn drain_and_integrate(
        &self,
        mission: &mut Mission,
        consumer: &mut MergeQueueConsumer,
        expected: usize,
        units: &mut HashMap<String, WorkUnit>,
        budget: &mut EmaBudget,
        merged_files: &mut HashSet<String>,
    ) -> ControlResult<(u32, u32)> {
        let mut merged = 0u32;
        let mut failed = 0u32;
        if expected == 0 {
            return Ok((merged, failed));
        }

        let submissions = consumer
            .drain(expected, Duration::from_secs(DRAIN_PER_ITEM_SECS))
            .await;
        if submissions.len() < expected {
            warn!(
                expected,
                received = submissions.len(),
                "merge queue drain returned a partial batch"
            );
        }

        for submission in submissions {
            let unit_id = submission.unit_id.clone();
            let Some(unit) = units.get_mut(&unit_id) else {
                continue;
            };
            let envelope_cost = submission.envelope.cost_usd;
            let ws_path = submission.workspace.path().to_path_buf();

            // Anything the worker surfaced for future planning outlives
            // the submission.
            for note in submission
                .envelope
                .context_items
                .iter()
                .chain(&submission.envelope.discoveries)
            {
                let item = crate::store::ContextItem::new(
                    mission.id.clone(),
                    Some(unit_id.clone()),
                    note.clone(),
                );
                if let Err(e) = self.store.put_context_item(&item) {
                    warn!(unit_id = %unit_id, error = %e, "failed to persist context item");
                }
            }

            let result = match self
                .green
                .process(submission, unit, &mission.objective)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    failed += 1;
                    error!(unit_id = %unit_id, error = %e, "integration errored");
                    self.changelog.log_failure(
                        &unit_id,
                        e.kind_label(),
                        &e.to_string(),
                        Some(&ws_path),
                    )?;
                    unit.record_failure(UnitState::Rejected, e.to_string());
                    self.store.put_unit(unit)?;
                    continue;
                }
            };

            budget.record(envelope_cost);
            mission.total_cost_usd += envelope_cost + result.fixup_cost_usd;

            match result.outcome {
                ProcessOutcome::Completed {
                    green_sha,
                    criteria_passed,
                    diff,
                    changed_files,
                } => {
                    merged += 1;
                    merged_files.extend(changed_files);
                    self.changelog.log_merge(&unit_id, "merged into mc/working")?;
                    self.changelog.log_promotion(&unit_id, &green_sha)?;
                    self.events.publish(MissionEvent::UnitMerged {
                        mission_id: mission.id.clone(),
                        unit_id: unit_id.clone(),
                        timestamp: Utc::now(),
                    });
                    self.events.publish(MissionEvent::GreenAdvanced {
                        mission_id: mission.id.clone(),
                        sha: green_sha,
                        timestamp: Utc::now(),
                    });
                    self.events.publish(MissionEvent::UnitCompleted {
                        mission_id: mission.id.clone(),
                        unit_id: unit_id.clone(),
                        timestamp: Utc::now(),
                    });

                    let skip_review = self.config.review.skip_when_criteria_passed
                        && criteria_passed;
                    if !skip_review {
                        self.reviewer.spawn_review(unit_id.clone(), diff);
                    }
                }
                ProcessOutcome::AlreadyIntegrated => {
                    merged += 1;
                    self.events.publish(MissionEvent::UnitCompleted {
                        mission_id: mission.id.clone(),
                        unit_id: unit_id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                ProcessOutcome::Rejected { reason } => {
                    failed += 1;
                    self.changelog
                        .log_failure(&unit_id, "content", &reason, Some(&ws_path))?;
                    self.events.publish(MissionEvent::UnitRolledBack {
                        mission_id: mission.id.clone(),
                        unit_id: unit_id.clone(),
                        reason,
                        timestamp: Utc::now(),
                    });
                }
                ProcessOutcome::Abandoned { reason } => {
                    failed += 1;
                    self.changelog
                        .log_failure(&unit_id, "integrity", &reason, Some(&ws_path))?;
                    self.events.publish(MissionEvent::UnitRolledBack {
                        mission_id: mission.id.clone(),
                        unit_id: unit_id.clone(),
                        reason,
                        timestamp: Utc::now(),
                    });
                }
            }
            self.store.put_unit(unit)?;
        }

        Ok((merged, failed))
    }

    async fn finish(
        &self,
        mut mission: Mission,
        reason: StopReason,
        made_progress: bool,
        epochs_run: u32,
    ) -> ControlResult<MissionOutcome> {
        mission.stop(reason);
        self.store.put_mission(&mission)?;

        let green_sha = self.green.green_sha().await.ok();
        self.changelog.log_stop(
            &reason.to_string(),
            mission.total_cost_usd,
            green_sha.as_deref(),
        )?;
        self.events.publish(MissionEvent::MissionStopped {
            mission_id: mission.id.clone(),
            reason,
            total_cost_usd: mission.total_cost_usd,
            timestamp: Utc::now(),
        });

        info!(
            mission_id = %mission.id,
            reason = %reason,
            cost = mission.total_cost_usd,
            epochs = epochs_run,
            made_progress,
            "mission finished"
        );

        Ok(MissionOutcome {
            mission_id: mission.id,
            stop_reason: reason,
            made_progress,
            total_cost_usd: mission.total_cost_usd,
            epochs_run,
            exit_code: reason.exit_code(made_progress),
        })
    }
}

fn describe_envelope_failure(envelope: &ResultEnvelope) -> String {
    match &envelope.error_kind {
        Some(kind) => format!("{kind}: {}", envelope.summary),
        None => format!("worker exited {} without a branch", envelope.exit_status),
    }
}
