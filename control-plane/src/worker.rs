//! Worker backend interface and the result envelope contract.
//!
//! A worker is an opaque command launched against a workspace clone. Its
//! only obligations: leave its changes committed on the branch it was
//! given (or one it names), and print an `MC_RESULT` block to stdout.
//! Unparseable output degrades to `error_kind = "parse_failure"` and
//! never crashes the controller.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ControlError, ControlResult};
use crate::store::WorkUnit;

/// First line of the worker's result block.
pub const MC_RESULT_BEGIN: &str = "MC_RESULT_BEGIN";
/// Last line of the worker's result block.
pub const MC_RESULT_END: &str = "MC_RESULT_END";

/// Error kind recorded when the envelope could not be parsed.
pub const ERROR_KIND_PARSE_FAILURE: &str = "parse_failure";
/// Error kind recorded when the worker process exceeded its timeout.
pub const ERROR_KIND_TIMEOUT: &str = "timeout";

/// Structured body of the `MC_RESULT` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McResult {
    pub status: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub tests_passed: Option<u32>,
    #[serde(default)]
    pub lint_errors: Option<u32>,
    #[serde(default)]
    pub discoveries: Vec<String>,
    #[serde(default)]
    pub context_items: Vec<String>,
}

/// Normalised worker output consumed by the rest of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub unit_id: String,
    pub exit_status: i32,
    pub branch: Option<String>,
    pub files_changed: Vec<String>,
    pub summary: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub tests_passed: Option<u32>,
    pub lint_errors: Option<u32>,
    pub discoveries: Vec<String>,
    pub context_items: Vec<String>,
    pub error_kind: Option<String>,
    /// Raw block text, kept for debugging when parsing degraded.
    pub raw_block: Option<String>,
}

impl ResultEnvelope {
    /// Build an envelope from raw worker stdout.
    pub fn from_worker_output(unit_id: impl Into<String>, exit_status: i32, stdout: &str) -> Self {
        let unit_id = unit_id.into();
        match extract_mc_result(stdout) {
            Ok((mc, raw)) => {
                let worker_failed = exit_status != 0 || mc.status != "ok";
                Self {
                    unit_id,
                    exit_status,
                    branch: mc.branch,
                    files_changed: mc.files_changed,
                    summary: mc.summary,
                    cost_usd: mc.cost_usd,
                    tokens: mc.tokens,
                    tests_passed: mc.tests_passed,
                    lint_errors: mc.lint_errors,
                    discoveries: mc.discoveries,
                    context_items: mc.context_items,
                    error_kind: worker_failed.then(|| format!("worker_{}", mc.status)),
                    raw_block: Some(raw),
                }
            }
            Err(reason) => {
                warn!(unit_id = %unit_id, %reason, "worker envelope unparseable; raw stdout follows");
                warn!(unit_id = %unit_id, stdout = %truncate(stdout, 2000), "raw worker stdout");
                Self {
                    unit_id,
                    exit_status,
                    branch: None,
                    files_changed: Vec::new(),
                    summary: reason,
                    cost_usd: 0.0,
                    tokens: 0,
                    tests_passed: None,
                    lint_errors: None,
                    discoveries: Vec::new(),
                    context_items: Vec::new(),
                    error_kind: Some(ERROR_KIND_PARSE_FAILURE.to_string()),
                    raw_block: Some(truncate(stdout, 4000)),
                }
            }
        }
    }

    /// Envelope for a worker that never produced output.
    pub fn failed(
        unit_id: impl Into<String>,
        error_kind: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            exit_status: -1,
            branch: None,
            files_changed: Vec::new(),
            summary: summary.into(),
            cost_usd: 0.0,
            tokens: 0,
            tests_passed: None,
            lint_errors: None,
            discoveries: Vec::new(),
            context_items: Vec::new(),
            error_kind: Some(error_kind.into()),
            raw_block: None,
        }
    }

    /// Whether the worker reported a usable branch.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && self.error_kind.is_none() && self.branch.is_some()
    }
}

/// Pull the JSON body out of the `MC_RESULT` block.
fn extract_mc_result(stdout: &str) -> Result<(McResult, String), String> {
    let begin = stdout
        .find(MC_RESULT_BEGIN)
        .ok_or_else(|| format!("no {MC_RESULT_BEGIN} marker in worker output"))?;
    let after_begin = begin + MC_RESULT_BEGIN.len();
    let end = stdout[after_begin..]
        .find(MC_RESULT_END)
        .map(|off| after_begin + off)
        .ok_or_else(|| format!("no {MC_RESULT_END} marker in worker output"))?;

    let body = stdout[after_begin..end].trim();
    let mc: McResult =
        serde_json::from_str(body).map_err(|e| format!("invalid MC_RESULT json: {e}"))?;
    Ok((mc, body.to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated at {} bytes]", &s[..end], s.len())
}

/// One dispatch of one unit against one workspace.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub unit: WorkUnit,
    pub workspace: PathBuf,
    /// Branch the worker is expected to commit to; pre-created in the clone.
    pub branch: String,
    pub objective: String,
    pub attempt: u32,
    pub session_budget_usd: f64,
    pub timeout: Duration,
    /// Set for fixup candidates so each gets a distinct prompt variant.
    pub fixup_variant: Option<u32>,
    /// Failure summary from the attempt being fixed up.
    pub failure_context: Option<String>,
}

/// Pluggable worker launcher: local subprocess, remote, container.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Run one worker to completion and return its envelope.
    ///
    /// Infrastructure failures (cannot spawn) are errors; worker-level
    /// failures come back inside the envelope.
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope>;
}

/// Launches the configured worker command as a local subprocess.
///
/// The unit's coordinates travel in the environment, so any executable
/// honouring the `MC_*` variables and the envelope contract plugs in.
pub struct LocalProcessBackend {
    command: String,
}

impl LocalProcessBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl WorkerBackend for LocalProcessBackend {
    async fn run(&self, request: &WorkerRequest) -> ControlResult<ResultEnvelope> {
        let argv = shlex::split(&self.command)
            .ok_or_else(|| ControlError::Worker(format!("unparseable command: {}", self.command)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ControlError::Worker("empty worker command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&request.workspace)
            .env("MC_UNIT_ID", &request.unit.id)
            .env("MC_UNIT_DESCRIPTION", &request.unit.description)
            .env("MC_OBJECTIVE", &request.objective)
            .env("MC_BRANCH", &request.branch)
            .env("MC_ATTEMPT", request.attempt.to_string())
            .env(
                "MC_SPECIALIST",
                request.unit.specialist_tag.as_deref().unwrap_or(""),
            )
            .env(
                "MC_NEEDS_RESEARCH",
                if request.unit.needs_research { "1" } else { "0" },
            )
            .env(
                "MC_SESSION_BUDGET_USD",
                format!("{:.2}", request.session_budget_usd),
            )
            .kill_on_drop(true);
        if let Some(variant) = request.fixup_variant {
            cmd.env("MC_FIXUP_VARIANT", variant.to_string());
        }
        if let Some(context) = &request.failure_context {
            cmd.env("MC_FAILURE_CONTEXT", context);
        }
        // Own process group: a timeout kill must take worker children too.
        #[cfg(unix)]
        cmd.process_group(0);

        match tokio::time::timeout(request.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let exit_status = output.status.code().unwrap_or(-1);
                Ok(ResultEnvelope::from_worker_output(
                    &request.unit.id,
                    exit_status,
                    &stdout,
                ))
            }
            Ok(Err(e)) => Err(ControlError::Worker(format!(
                "failed to spawn worker: {e}"
            ))),
            Err(_) => Ok(ResultEnvelope::failed(
                &request.unit.id,
                ERROR_KIND_TIMEOUT,
                format!("worker exceeded {}s", request.timeout.as_secs()),
            )),
        }
    }
}
