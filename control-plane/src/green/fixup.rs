//! N-of-M fixup candidate generation and selection.
//!
//! When a merge or verification fails with retries remaining, several
//! fixup workers run in parallel against separate clones, each with a
//! distinct prompt variant. Candidates compete in a lexicographic
//! tournament: most tests passed, then fewest lint errors, then smallest
//! diff, ties broken by submission order. The winner is merged as if it
//! had been the original submission; losers' clones go back to the pool.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::ControlResult;
use crate::store::WorkUnit;
use crate::worker::{ResultEnvelope, WorkerBackend, WorkerRequest};
use crate::workspace::{WorkspaceHandle, WorkspacePool};

/// Scored fixup candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupScore {
    /// Order the candidate was submitted in; the final tie-break.
    pub index: usize,
    pub tests_passed: u32,
    pub lint_errors: u32,
    pub diff_lines: usize,
}

/// Pick the winning candidate index by lexicographic tournament.
///
/// Ordering: `tests_passed` descending, `lint_errors` ascending,
/// `diff_lines` ascending, then earliest submission.
pub fn select_winner(candidates: &[FixupScore]) -> Option<usize> {
    candidates
        .iter()
        .min_by(|a, b| {
            b.tests_passed
                .cmp(&a.tests_passed)
                .then(a.lint_errors.cmp(&b.lint_errors))
                .then(a.diff_lines.cmp(&b.diff_lines))
                .then(a.index.cmp(&b.index))
        })
        .map(|best| best.index)
}

/// The surviving candidate of a fixup round, ready to merge.
pub struct FixupWinner {
    pub workspace: WorkspaceHandle,
    pub branch: String,
    pub envelope: ResultEnvelope,
    pub score: FixupScore,
}

/// Outcome of one fixup round, with the cost of every candidate that ran.
pub struct FixupRoundResult {
    pub winner: Option<FixupWinner>,
    pub candidates_tried: usize,
    pub cost_usd: f64,
}

/// Run one round of parallel fixup candidates for `unit`.
///
/// Candidates that fail to acquire a clone, fail to run, or report no
/// usable branch simply drop out; their clones return to the pool on
/// drop. `winner` is `None` when no candidate is viable.
#[allow(clippy::too_many_arguments)]
pub async fn run_fixup_round(
    backend: Arc<dyn WorkerBackend>,
    pool: &WorkspacePool,
    unit: &WorkUnit,
    objective: &str,
    failure_context: &str,
    candidate_count: usize,
    session_timeout: Duration,
    session_budget_usd: f64,
) -> ControlResult<FixupRoundResult> {
    let attempt = unit.attempt_count + 1;

    let runs = (0..candidate_count).map(|variant| {
        let backend = Arc::clone(&backend);
        let pool = pool.clone();
        async move {
            // A candidate that cannot get a clone quickly drops out rather
            // than stalling the round.
            let workspace = match pool.acquire(Duration::from_secs(30)).await {
                Ok(Some(ws)) => ws,
                Ok(None) => {
                    warn!(unit_id = %unit.id, variant, "no clone free for fixup candidate");
                    return (0.0, None);
                }
                Err(e) => {
                    warn!(unit_id = %unit.id, variant, error = %e, "fixup clone acquire failed");
                    return (0.0, None);
                }
            };

            let git = workspace.git();
            let Ok(base_sha) = git.rev_parse("HEAD").await else {
                return (0.0, None);
            };
            let branch = format!("mc/fixup/{}-v{}", unit.id, variant);
            if git.run(&["checkout", "-b", &branch]).await.is_err() {
                return (0.0, None);
            }

            let request = WorkerRequest {
                unit: unit.clone(),
                workspace: workspace.path().to_path_buf(),
                branch: branch.clone(),
                objective: objective.to_string(),
                attempt,
                session_budget_usd,
                timeout: session_timeout,
                fixup_variant: Some(variant as u32),
                failure_context: Some(failure_context.to_string()),
            };

            let envelope = match backend.run(&request).await {
                Ok(env) => env,
                Err(e) => {
                    warn!(unit_id = %unit.id, variant, error = %e, "fixup candidate errored");
                    return (0.0, None);
                }
            };
            let cost = envelope.cost_usd;
            if !envelope.succeeded() {
                return (cost, None);
            }

            let candidate_branch = envelope.branch.clone().unwrap_or(branch);
            // The branch the worker names must actually exist in its clone.
            let head = match git
                .rev_parse_opt(&format!("refs/heads/{candidate_branch}"))
                .await
            {
                Ok(Some(sha)) => sha,
                _ => return (cost, None),
            };
            let diff_lines = git.diff_lines(&base_sha, &head).await.unwrap_or(usize::MAX);

            (
                cost,
                Some((workspace, candidate_branch, envelope, diff_lines, variant)),
            )
        }
    });

    let mut cost_usd = 0.0;
    let mut viable: Vec<(WorkspaceHandle, String, ResultEnvelope, FixupScore)> = Vec::new();
    for (cost, result) in join_all(runs).await {
        cost_usd += cost;
        if let Some((workspace, branch, envelope, diff_lines, variant)) = result {
            let score = FixupScore {
                index: variant,
                tests_passed: envelope.tests_passed.unwrap_or(0),
                lint_errors: envelope.lint_errors.unwrap_or(0),
                diff_lines,
            };
            viable.push((workspace, branch, envelope, score));
        }
    }

    if viable.is_empty() {
        info!(unit_id = %unit.id, candidate_count, "fixup round produced no viable candidate");
        return Ok(FixupRoundResult {
            winner: None,
            candidates_tried: candidate_count,
            cost_usd,
        });
    }

    let scores: Vec<FixupScore> = viable.iter().map(|(_, _, _, s)| s.clone()).collect();
    let winner_index = select_winner(&scores).expect("non-empty candidates");

    let position = viable
        .iter()
        .position(|(_, _, _, s)| s.index == winner_index)
        .expect("winner present");
    let (workspace, branch, envelope, score) = viable.swap_remove(position);
    // Remaining candidates drop here; their clones return to the pool.

    info!(
        unit_id = %unit.id,
        winner = score.index,
        tests = score.tests_passed,
        lint = score.lint_errors,
        diff = score.diff_lines,
        "fixup tournament decided"
    );

    Ok(FixupRoundResult {
        winner: Some(FixupWinner {
            workspace,
            branch,
            envelope,
            score,
        }),
        candidates_tried: candidate_count,
        cost_usd,
    })
}
