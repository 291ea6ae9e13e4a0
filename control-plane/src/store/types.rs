//! Persistent record types for missions, epochs, and work units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

/// Why a mission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ObjectiveMet,
    TimeBudget,
    CostBudget,
    RepeatedTotalFailure,
    Stalled,
    Internal,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ObjectiveMet => "objective_met",
            Self::TimeBudget => "time_budget",
            Self::CostBudget => "cost_budget",
            Self::RepeatedTotalFailure => "repeated_total_failure",
            Self::Stalled => "stalled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl StopReason {
    /// Process exit code for the mission driver.
    ///
    /// `made_progress` is whether `mc/green` advanced at least once.
    pub fn exit_code(&self, made_progress: bool) -> i32 {
        match self {
            Self::ObjectiveMet => 0,
            Self::TimeBudget => {
                if made_progress {
                    0
                } else {
                    1
                }
            }
            Self::RepeatedTotalFailure | Self::Stalled => 1,
            Self::CostBudget => 2,
            Self::Internal => 70,
        }
    }
}

/// The top-level run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub objective: String,
    pub verification_command: String,
    pub budget_usd: f64,
    pub wall_time_budget_secs: u64,
    pub started_at: DateTime<Utc>,
    pub status: MissionStatus,
    pub stop_reason: Option<StopReason>,
    pub total_cost_usd: f64,
}

impl Mission {
    pub fn new(
        objective: impl Into<String>,
        verification_command: impl Into<String>,
        budget_usd: f64,
        wall_time_budget_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            objective: objective.into(),
            verification_command: verification_command.into(),
            budget_usd,
            wall_time_budget_secs,
            started_at: Utc::now(),
            status: MissionStatus::Running,
            stop_reason: None,
            total_cost_usd: 0.0,
        }
    }

    /// Terminal-state transition. Stop reasons map onto statuses:
    /// objective met completes, internal errors fail, everything else stops.
    pub fn stop(&mut self, reason: StopReason) {
        self.status = match reason {
            StopReason::ObjectiveMet => MissionStatus::Completed,
            StopReason::Internal => MissionStatus::Failed,
            _ => MissionStatus::Stopped,
        };
        self.stop_reason = Some(reason);
    }
}

/// One plan/dispatch/merge/feedback cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub id: String,
    pub mission_id: String,
    pub ordinal: u32,
    pub planned_unit_ids: Vec<String>,
    pub dispatched_unit_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ambition_score: f32,
    pub all_failed: bool,
    pub cost_usd: f64,
}

impl Epoch {
    pub fn new(mission_id: impl Into<String>, ordinal: u32, ambition_score: f32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mission_id: mission_id.into(),
            ordinal,
            planned_unit_ids: Vec::new(),
            dispatched_unit_ids: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            ambition_score,
            all_failed: false,
            cost_usd: 0.0,
        }
    }
}

/// Work-unit lifecycle. Monotonic modulo retry: a retry bumps
/// `attempt_count` instead of rewinding the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Dispatched,
    Merged,
    RolledBack,
    Rejected,
    Stale,
    Completed,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Merged => "merged",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
            Self::Stale => "stale",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// A dispatchable task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub mission_id: String,
    pub epoch_id: Option<String>,
    pub description: String,
    /// Paths the unit is expected to touch; drives overlap exclusion.
    pub files_hint: Vec<String>,
    /// Unit ids that must complete first.
    pub depends_on: Vec<String>,
    /// Shell commands that must exit 0 after the merge.
    pub acceptance_criteria: Vec<String>,
    /// Opaque selector for the worker prompt profile.
    pub specialist_tag: Option<String>,
    pub needs_research: bool,
    pub state: UnitState,
    pub attempt_count: u32,
    pub queued_at: DateTime<Utc>,
    pub last_failure_reason: Option<String>,
}

impl WorkUnit {
    pub fn new(mission_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mission_id: mission_id.into(),
            epoch_id: None,
            description: description.into(),
            files_hint: Vec::new(),
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            specialist_tag: None,
            needs_research: false,
            state: UnitState::Pending,
            attempt_count: 0,
            queued_at: Utc::now(),
            last_failure_reason: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_hint = files;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    /// Begin an attempt. Each dispatch is a fresh attempt record.
    pub fn begin_attempt(&mut self, epoch_id: &str) {
        self.epoch_id = Some(epoch_id.to_string());
        self.state = UnitState::Dispatched;
        self.attempt_count += 1;
    }

    pub fn record_failure(&mut self, state: UnitState, reason: impl Into<String>) {
        self.state = state;
        self.last_failure_reason = Some(reason.into());
    }

    /// Whether the unit has reached a state no further dispatch can change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            UnitState::Completed | UnitState::Rejected | UnitState::Stale
        )
    }
}

/// Cross-mission work candidate, owned by the external planner/strategist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub description: String,
    pub impact: f32,
    pub effort: f32,
    pub attempt_count: u32,
    pub pinned_score: Option<f32>,
    pub last_failure: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

/// A piece of context a worker surfaced for future planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub mission_id: String,
    pub source_unit_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ContextItem {
    pub fn new(
        mission_id: impl Into<String>,
        source_unit_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mission_id: mission_id.into(),
            source_unit_id,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Post-promotion review scores. Absence never blocks progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub unit_id: String,
    pub alignment: u8,
    pub approach: u8,
    pub tests: u8,
    pub notes: String,
    pub parsed: bool,
    /// Raw reviewer output, kept when parsing failed.
    pub raw_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReviewRecord {
    /// Mean of the three axes.
    pub fn aggregate(&self) -> f32 {
        f32::from(self.alignment + self.approach + self.tests) / 3.0
    }

    /// Record for an output the parser could not understand.
    pub fn unparsed(unit_id: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            alignment: 0,
            approach: 0,
            tests: 0,
            notes: String::new(),
            parsed: false,
            raw_output: Some(raw.into()),
            created_at: Utc::now(),
        }
    }
}

/// Per-epoch summary fed back to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub mission_id: String,
    pub epoch_ordinal: u32,
    pub merged_units: u32,
    pub failed_units: u32,
    pub green_sha: Option<String>,
    pub cost_usd: f64,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(mission_id: impl Into<String>, epoch_ordinal: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mission_id: mission_id.into(),
            epoch_ordinal,
            merged_units: 0,
            failed_units: 0,
            green_sha: None,
            cost_usd: 0.0,
            summary: String::new(),
            created_at: Utc::now(),
        }
    }
}
