//! Planner interface.
//!
//! The planner is an external collaborator: it proposes ordered work
//! units with a dependency graph and acceptance criteria, and replans
//! when the controller rejects a plan (cycle, low ambition) or reports a
//! stall. The core only consumes plans.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ControlError, ControlResult};
use crate::store::{BacklogItem, Mission, Reflection, WorkUnit};

/// Everything a planner sees when asked for the next epoch.
#[derive(Debug, Clone, Serialize)]
pub struct PlanContext {
    pub mission: Mission,
    pub epoch_ordinal: u32,
    pub max_units: usize,
    pub reflections: Vec<Reflection>,
    pub backlog: Vec<BacklogItem>,
    /// Descriptions of units dropped as stale since the last plan.
    pub stale_context: Vec<String>,
    /// Why the previous proposal was rejected, when replanning.
    pub rejection_feedback: Option<String>,
}

/// A proposed epoch: units plus the planner's own ambition score.
#[derive(Debug, Clone)]
pub struct EpochPlan {
    pub units: Vec<WorkUnit>,
    pub ambition_score: f32,
}

/// Produces epoch plans. Implementations live outside the core.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn propose(&self, ctx: &PlanContext) -> ControlResult<EpochPlan>;
}

/// Unit descriptor in the external planner's JSON output.
///
/// `id` is a plan-local alias; `depends_on` refers to aliases within the
/// same plan and is rewritten to real unit ids on materialisation.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedUnit {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub files_hint: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub specialist_tag: Option<String>,
    #[serde(default)]
    pub needs_research: bool,
}

/// External planner's JSON output shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanOutput {
    pub ambition_score: f32,
    #[serde(default)]
    pub units: Vec<PlannedUnit>,
}

/// Turn planner output into work units with real ids, resolving
/// plan-local dependency aliases.
pub fn materialize_plan(mission_id: &str, output: PlanOutput) -> ControlResult<EpochPlan> {
    let mut units: Vec<WorkUnit> = Vec::with_capacity(output.units.len());
    let mut alias_to_id: HashMap<String, String> = HashMap::new();

    for planned in &output.units {
        let mut unit = WorkUnit::new(mission_id, planned.description.clone());
        unit.files_hint = planned.files_hint.clone();
        unit.acceptance_criteria = planned.acceptance_criteria.clone();
        unit.specialist_tag = planned.specialist_tag.clone();
        unit.needs_research = planned.needs_research;
        if let Some(alias) = &planned.id {
            alias_to_id.insert(alias.clone(), unit.id.clone());
        }
        units.push(unit);
    }

    for (unit, planned) in units.iter_mut().zip(&output.units) {
        for dep in &planned.depends_on {
            let resolved = alias_to_id.get(dep).ok_or_else(|| {
                ControlError::Planner(format!("dependency on unknown unit alias `{dep}`"))
            })?;
            unit.depends_on.push(resolved.clone());
        }
    }

    Ok(EpochPlan {
        units,
        ambition_score: output.ambition_score,
    })
}

/// Planner adapter that shells out to a configured command.
///
/// The context goes to the subprocess as JSON on stdin; the plan comes
/// back as JSON on stdout.
pub struct CommandPlanner {
    command: String,
    timeout: Duration,
}

impl CommandPlanner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    async fn propose(&self, ctx: &PlanContext) -> ControlResult<EpochPlan> {
        use tokio::io::AsyncWriteExt;

        let argv = shlex::split(&self.command).ok_or_else(|| {
            ControlError::Planner(format!("unparseable planner command: {}", self.command))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ControlError::Planner("empty planner command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ControlError::Planner(format!("failed to spawn planner: {e}")))?;

        let ctx_json = serde_json::to_vec(ctx)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&ctx_json)
                .await
                .map_err(|e| ControlError::Planner(format!("failed to write context: {e}")))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ControlError::Timeout {
                what: "planner".to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| ControlError::Planner(format!("planner wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::Planner(format!(
                "planner exited {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let parsed: PlanOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| ControlError::parse("planner output", e.to_string()))?;
        materialize_plan(&ctx.mission.id, parsed)
    }
}
