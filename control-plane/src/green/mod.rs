//! Green-branch management.
//!
//! Owns the two integration refs. `mc/working` is the merge target and
//! may be hard-reset; `mc/green` is the verified line and only ever
//! advances by fast-forward. All git activity happens in a dedicated
//! integration clone, never in the user's checkout of the target.
//!
//! Submission pipeline: fast-forward check, merge into `mc/working`,
//! pre-merge verification, acceptance criteria, fast-forward promotion
//! of `mc/green`, optional push. Failures roll `mc/working` back to the
//! pre-merge state and escalate to the fixup tournament while attempts
//! remain.

pub mod fixup;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::breaker::{CircuitBreakerSet, Outcome, COMPONENT_GREEN_BRANCH};
use crate::config::{AutoPushPolicy, GreenBranchConfig, VerificationConfig};
use crate::error::{ControlError, ControlResult, FailureClass};
use crate::gitops::GitRunner;
use crate::queue::MergeSubmission;
use crate::store::{UnitState, WorkUnit};
use crate::verify::CheckRunner;
use crate::worker::WorkerBackend;
use crate::workspace::WorkspacePool;

use fixup::run_fixup_round;

/// Integration target branch; may be reset with `--hard`.
pub const WORKING_BRANCH: &str = "mc/working";
/// Verified branch; fast-forward only.
pub const GREEN_BRANCH: &str = "mc/green";
/// Full ref of the integration target.
pub const WORKING_REF: &str = "refs/heads/mc/working";
/// Full ref of the verified line.
pub const GREEN_REF: &str = "refs/heads/mc/green";
/// Push-tracking ref, force-updated from `mc/green` before pushing.
pub const PUSH_TRACKING_REF: &str = "refs/mc/green-push";

/// Why a submission was rolled back. All of these are content failures
/// eligible for fixup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    Conflict,
    VerificationFailed(String),
    AcceptanceFailed(String),
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict => write!(f, "merge conflict"),
            Self::VerificationFailed(detail) => write!(f, "verification failed: {detail}"),
            Self::AcceptanceFailed(detail) => write!(f, "acceptance failed: {detail}"),
        }
    }
}

/// Result of one trip through the merge pipeline.
#[derive(Debug)]
enum IntegrationOutcome {
    Promoted {
        pre_sha: String,
        green_sha: String,
        criteria_passed: bool,
    },
    AlreadyIntegrated,
    RolledBack(RollbackReason),
}

/// Terminal result of processing one submission, fixups included.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Unit promoted to `mc/green`.
    Completed {
        green_sha: String,
        criteria_passed: bool,
        diff: String,
        changed_files: Vec<String>,
    },
    /// Branch was already an ancestor of `mc/green`; idempotent no-op.
    AlreadyIntegrated,
    /// Content failure with no viable fixup or attempts exhausted.
    Rejected { reason: String },
    /// Infrastructure failure; the green_branch breaker saw it.
    Abandoned { reason: String },
}

/// [`ProcessOutcome`] plus the cost of any fixup candidates that ran.
#[derive(Debug)]
pub struct ProcessResult {
    pub outcome: ProcessOutcome,
    pub fixup_cost_usd: f64,
}

/// Where an auto-push attempt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Disabled,
    Pushed,
    /// Upstream diverged and policy said to leave it alone.
    Diverged,
    /// Upstream diverged; merged it into `mc/working` for the next cycle.
    Deferred,
    Failed(String),
}

/// Owns `mc/working` and `mc/green` in the integration clone.
pub struct GreenBranchManager {
    git: GitRunner,
    checks: CheckRunner,
    pool: WorkspacePool,
    backend: Arc<dyn WorkerBackend>,
    breakers: Arc<CircuitBreakerSet>,
    green_cfg: GreenBranchConfig,
    verification: VerificationConfig,
    verify_before_merge: bool,
    session_timeout: Duration,
    session_budget_usd: f64,
}

impl GreenBranchManager {
    /// Set up the integration clone and both refs.
    ///
    /// Missing refs are created at `origin/<base_branch>`; existing ones
    /// are validated against the green-is-ancestor-of-working invariant.
    #[allow(clippy::too_many_arguments)]
    pub async fn provision(
        source: &Path,
        state_dir: &Path,
        base_branch: &str,
        pool: WorkspacePool,
        backend: Arc<dyn WorkerBackend>,
        breakers: Arc<CircuitBreakerSet>,
        green_cfg: GreenBranchConfig,
        verification: VerificationConfig,
        verify_before_merge: bool,
        session_timeout: Duration,
        session_budget_usd: f64,
    ) -> ControlResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let integration_dir = state_dir.join("integration");
        if !integration_dir.join(".git").exists() {
            info!(dir = %integration_dir.display(), "provisioning integration clone");
            GitRunner::new(state_dir)
                .run_with_retry(&[
                    "clone",
                    "--shared",
                    "--quiet",
                    &source.display().to_string(),
                    &integration_dir.display().to_string(),
                ])
                .await?;
        }

        crate::workspace::ensure_commit_identity(&integration_dir).await?;

        let verify_timeout = Duration::from_secs(verification.timeout.max(60));
        let git = GitRunner::new(&integration_dir).with_timeout(verify_timeout);
        let checks = CheckRunner::new(&integration_dir);

        let base = git
            .rev_parse_opt(&format!("refs/remotes/origin/{base_branch}"))
            .await?
            .ok_or_else(|| {
                ControlError::config(format!("base branch `{base_branch}` not found on target"))
            })?;

        let working = match git.rev_parse_opt(WORKING_REF).await? {
            Some(sha) => sha,
            None => {
                git.update_ref(WORKING_REF, &base).await?;
                base.clone()
            }
        };
        let green = match git.rev_parse_opt(GREEN_REF).await? {
            Some(sha) => sha,
            None => {
                git.update_ref(GREEN_REF, &base).await?;
                base.clone()
            }
        };

        if !git.is_ancestor(&green, &working).await? {
            return Err(ControlError::integrity(format!(
                "{GREEN_BRANCH} ({green}) is not an ancestor of {WORKING_BRANCH} ({working})"
            )));
        }

        git.run(&["checkout", "--quiet", WORKING_BRANCH]).await?;

        Ok(Self {
            git,
            checks,
            pool,
            backend,
            breakers,
            green_cfg,
            verification,
            verify_before_merge,
            session_timeout,
            session_budget_usd,
        })
    }

    /// Current `mc/green` sha.
    pub async fn green_sha(&self) -> ControlResult<String> {
        self.git.rev_parse(GREEN_REF).await
    }

    /// Current `mc/working` sha.
    pub async fn working_sha(&self) -> ControlResult<String> {
        self.git.rev_parse(WORKING_REF).await
    }

    /// Git runner for the integration clone. Test hook and status probe.
    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Drive one submission to a terminal state, fixups included.
    pub async fn process(
        &self,
        mut submission: MergeSubmission,
        unit: &mut WorkUnit,
        objective: &str,
    ) -> ControlResult<ProcessResult> {
        let mut fixup_cost_usd = 0.0;

        if !self.breakers.allow(COMPONENT_GREEN_BRANCH) {
            return Ok(ProcessResult {
                outcome: ProcessOutcome::Abandoned {
                    reason: "green_branch circuit open".to_string(),
                },
                fixup_cost_usd,
            });
        }

        loop {
            match self.integrate(&submission, unit).await {
                Ok(IntegrationOutcome::Promoted {
                    pre_sha,
                    green_sha,
                    criteria_passed,
                }) => {
                    self.breakers.record(COMPONENT_GREEN_BRANCH, Outcome::Success);
                    unit.state = UnitState::Merged;
                    let diff = self.git.diff_text(&pre_sha, &green_sha).await.unwrap_or_default();
                    let changed_files = self
                        .git
                        .changed_files(&pre_sha, &green_sha)
                        .await
                        .unwrap_or_default();
                    unit.state = UnitState::Completed;
                    return Ok(ProcessResult {
                        outcome: ProcessOutcome::Completed {
                            green_sha,
                            criteria_passed,
                            diff,
                            changed_files,
                        },
                        fixup_cost_usd,
                    });
                }
                Ok(IntegrationOutcome::AlreadyIntegrated) => {
                    self.breakers.record(COMPONENT_GREEN_BRANCH, Outcome::Success);
                    unit.state = UnitState::Completed;
                    return Ok(ProcessResult {
                        outcome: ProcessOutcome::AlreadyIntegrated,
                        fixup_cost_usd,
                    });
                }
                Ok(IntegrationOutcome::RolledBack(reason)) => {
                    let reason_text = reason.to_string();
                    unit.record_failure(UnitState::RolledBack, reason_text.clone());

                    // attempt_count covers the original dispatch; fixups may
                    // add up to fixup_max_attempts more merge attempts.
                    if unit.attempt_count > self.green_cfg.fixup_max_attempts {
                        unit.state = UnitState::Rejected;
                        return Ok(ProcessResult {
                            outcome: ProcessOutcome::Rejected {
                                reason: format!("attempts exhausted: {reason_text}"),
                            },
                            fixup_cost_usd,
                        });
                    }

                    info!(
                        unit_id = %unit.id,
                        attempt = unit.attempt_count,
                        reason = %reason_text,
                        "escalating to fixup tournament"
                    );
                    let round = run_fixup_round(
                        Arc::clone(&self.backend),
                        &self.pool,
                        unit,
                        objective,
                        &reason_text,
                        self.green_cfg.fixup_candidates,
                        self.session_timeout,
                        self.session_budget_usd,
                    )
                    .await?;
                    fixup_cost_usd += round.cost_usd;

                    match round.winner {
                        Some(winner) => {
                            unit.attempt_count += 1;
                            // Winner replaces the failed submission; the old
                            // workspace drops back to the pool here.
                            submission = MergeSubmission::new(
                                winner.branch,
                                winner.envelope,
                                winner.workspace,
                            );
                        }
                        None => {
                            unit.state = UnitState::Rejected;
                            return Ok(ProcessResult {
                                outcome: ProcessOutcome::Rejected {
                                    reason: format!("no viable fixup: {reason_text}"),
                                },
                                fixup_cost_usd,
                            });
                        }
                    }
                }
                Err(e) if matches!(e.classify(), FailureClass::Content) => {
                    // Content errors surfaced as errors rather than outcomes
                    // still mean rollback happened; treat like exhaustion.
                    unit.record_failure(UnitState::Rejected, e.to_string());
                    return Ok(ProcessResult {
                        outcome: ProcessOutcome::Rejected {
                            reason: e.to_string(),
                        },
                        fixup_cost_usd,
                    });
                }
                Err(e) => {
                    // Filesystem and git-plumbing failures: trip the breaker
                    // and abandon. Promoted units are never un-promoted here.
                    self.breakers.record(COMPONENT_GREEN_BRANCH, Outcome::Failure);
                    unit.record_failure(UnitState::Rejected, e.to_string());
                    return Ok(ProcessResult {
                        outcome: ProcessOutcome::Abandoned {
                            reason: e.to_string(),
                        },
                        fixup_cost_usd,
                    });
                }
            }
        }
    }

    /// One pass through the merge pipeline for one submission.
    async fn integrate(
        &self,
        submission: &MergeSubmission,
        unit: &WorkUnit,
    ) -> ControlResult<IntegrationOutcome> {
        let unit_ref = format!("refs/mc/units/{}", submission.unit_id);
        self.git
            .fetch(
                &submission.workspace.path().display().to_string(),
                &format!("+refs/heads/{}:{unit_ref}", submission.branch_ref),
            )
            .await?;
        let branch_sha = self.git.rev_parse(&unit_ref).await?;

        // Idempotent re-merge: a branch already under mc/green needs nothing.
        if self.git.is_ancestor(&branch_sha, GREEN_REF).await? {
            info!(unit_id = %submission.unit_id, "branch already integrated");
            return Ok(IntegrationOutcome::AlreadyIntegrated);
        }

        let pre_sha = self.git.rev_parse(WORKING_REF).await?;
        let green_sha = self.git.rev_parse(GREEN_REF).await?;
        if !self.git.is_ancestor(&green_sha, &pre_sha).await? {
            return Err(ControlError::integrity(format!(
                "{GREEN_BRANCH} diverged from {WORKING_BRANCH} before merge"
            )));
        }

        let message = format!(
            "mc: merge unit {} (attempt {})",
            submission.unit_id, unit.attempt_count
        );
        let merge = self
            .git
            .output(&["merge", "--no-ff", &branch_sha, "-m", &message])
            .await?;
        if !merge.status.success() {
            let stderr = String::from_utf8_lossy(&merge.stderr).to_string();
            let _ = self.git.output(&["merge", "--abort"]).await;
            self.rollback(&pre_sha).await?;
            warn!(unit_id = %submission.unit_id, %stderr, "merge conflict, rolled back");
            return Ok(IntegrationOutcome::RolledBack(RollbackReason::Conflict));
        }

        if self.verify_before_merge && !self.verification.command.trim().is_empty() {
            let outcome = self
                .checks
                .run_check(
                    "verification",
                    &self.verification.command,
                    Duration::from_secs(self.verification.timeout),
                )
                .await?;
            if !outcome.passed {
                let detail = outcome
                    .stderr_excerpt
                    .clone()
                    .unwrap_or_else(|| "non-zero exit".to_string());
                self.rollback(&pre_sha).await?;
                return Ok(IntegrationOutcome::RolledBack(
                    RollbackReason::VerificationFailed(detail),
                ));
            }
        }

        let criteria = self
            .checks
            .run_criteria(
                &unit.acceptance_criteria,
                Duration::from_secs(self.verification.timeout),
            )
            .await?;
        if !criteria.all_passed {
            let detail = criteria
                .first_failure
                .clone()
                .unwrap_or_else(|| "criterion failed".to_string());
            self.rollback(&pre_sha).await?;
            return Ok(IntegrationOutcome::RolledBack(
                RollbackReason::AcceptanceFailed(detail),
            ));
        }
        // Vacuous passes do not count for the review-skip gate.
        let criteria_passed = !unit.acceptance_criteria.is_empty() && criteria.all_passed;

        let working_sha = self.git.rev_parse("HEAD").await?;
        if !self.git.is_ancestor(&green_sha, &working_sha).await? {
            // A non-fast-forward promotion attempt is a bug, not a retry.
            return Err(ControlError::integrity(format!(
                "promotion of {GREEN_BRANCH} would not be a fast-forward"
            )));
        }
        self.git.update_ref(GREEN_REF, &working_sha).await?;
        info!(unit_id = %submission.unit_id, green = %working_sha, "promoted to mc/green");

        self.sync_green_to_origin().await;
        let push = self.auto_push().await;
        if let PushStatus::Failed(ref reason) = push {
            warn!(unit_id = %submission.unit_id, %reason, "auto-push failed");
        }

        Ok(IntegrationOutcome::Promoted {
            pre_sha,
            green_sha: working_sha,
            criteria_passed,
        })
    }

    /// Reset `mc/working` to the pre-merge state, leaving no residue.
    async fn rollback(&self, pre_sha: &str) -> ControlResult<()> {
        self.git.reset_hard(pre_sha).await?;
        self.git.clean_untracked().await?;
        let restored = self.git.rev_parse("HEAD").await?;
        if restored != pre_sha {
            return Err(ControlError::integrity(format!(
                "rollback left {WORKING_BRANCH} at {restored}, expected {pre_sha}"
            )));
        }
        Ok(())
    }

    /// Mirror `mc/green` into the source repository so pool recycles see
    /// the latest verified base. Best effort.
    async fn sync_green_to_origin(&self) {
        if let Err(e) = self
            .git
            .run_with_retry(&[
                "push",
                "--quiet",
                "origin",
                &format!("+{GREEN_REF}:{GREEN_REF}"),
            ])
            .await
        {
            warn!(error = %e, "failed to sync mc/green to origin");
        }
    }

    /// Push `mc/green` to the configured upstream through the tracking ref.
    ///
    /// Push failures never abandon an already-promoted unit.
    async fn auto_push(&self) -> PushStatus {
        if !self.green_cfg.auto_push {
            return PushStatus::Disabled;
        }

        // Force-update the tracking ref from mc/green first.
        if let Err(e) = self
            .git
            .run_with_retry(&["fetch", ".", &format!("+{GREEN_BRANCH}:{PUSH_TRACKING_REF}")])
            .await
        {
            return PushStatus::Failed(format!("tracking ref update failed: {e}"));
        }

        let remote = self.green_cfg.push_remote.clone();
        let target = format!(
            "{PUSH_TRACKING_REF}:refs/heads/{}",
            self.green_cfg.push_branch
        );

        let result = match self.green_cfg.auto_push_policy {
            AutoPushPolicy::Force => {
                self.git
                    .run_with_retry(&["push", "--quiet", &remote, &format!("+{target}")])
                    .await
            }
            AutoPushPolicy::Abort | AutoPushPolicy::Merge => {
                self.git
                    .run_with_retry(&["push", "--quiet", &remote, &target])
                    .await
            }
        };

        match result {
            Ok(_) => PushStatus::Pushed,
            Err(e) => match self.green_cfg.auto_push_policy {
                AutoPushPolicy::Force => PushStatus::Failed(e.to_string()),
                AutoPushPolicy::Abort => {
                    warn!(error = %e, "upstream diverged; auto_push_policy=abort leaves it alone");
                    PushStatus::Diverged
                }
                AutoPushPolicy::Merge => self.merge_upstream_for_next_cycle(&remote).await,
            },
        }
    }

    /// Divergence handling for `auto_push_policy = merge`: pull the
    /// upstream branch into `mc/working` so the next promotion carries the
    /// reconciliation, and defer this push.
    async fn merge_upstream_for_next_cycle(&self, remote: &str) -> PushStatus {
        let branch = &self.green_cfg.push_branch;
        let upstream_ref = "refs/mc/upstream-merge";
        if let Err(e) = self
            .git
            .fetch(remote, &format!("+refs/heads/{branch}:{upstream_ref}"))
            .await
        {
            return PushStatus::Failed(format!("upstream fetch failed: {e}"));
        }

        let pre_sha = match self.git.rev_parse("HEAD").await {
            Ok(sha) => sha,
            Err(e) => return PushStatus::Failed(e.to_string()),
        };
        let merge = self
            .git
            .output(&[
                "merge",
                "--no-ff",
                upstream_ref,
                "-m",
                &format!("mc: reconcile upstream {branch}"),
            ])
            .await;
        match merge {
            Ok(out) if out.status.success() => PushStatus::Deferred,
            _ => {
                let _ = self.git.output(&["merge", "--abort"]).await;
                if let Err(e) = self.rollback(&pre_sha).await {
                    return PushStatus::Failed(format!("upstream merge rollback failed: {e}"));
                }
                PushStatus::Diverged
            }
        }
    }
}
