//! Mission configuration.
//!
//! Loaded from a TOML file into nested sections. Every field has a serde
//! default so a minimal file only needs `[target]` filled in.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// What to do when `auto_push` is enabled and the upstream has diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoPushPolicy {
    /// Force-push the tracking ref over the upstream.
    Force,
    /// Log the divergence and leave the upstream alone.
    #[default]
    Abort,
    /// Fetch the upstream branch, merge it into `mc/working`, retry once.
    Merge,
}

/// Target repository and verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Path to the source repository the mission operates on.
    pub path: PathBuf,
    /// Base branch workers start from when `mc/green` does not exist yet.
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub verification: VerificationConfig,
}

/// The mission-wide verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Shell command that must exit 0 for a merge to survive.
    #[serde(default)]
    pub command: String,
    /// Seconds before the command is killed and counted as a failure.
    #[serde(default = "default_verify_timeout")]
    pub timeout: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout: default_verify_timeout(),
        }
    }
}

/// Worker scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Seconds a single worker run may take before it is killed.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: ParallelConfig::default(),
            budget: BudgetConfig::default(),
            session_timeout: default_session_timeout(),
        }
    }
}

/// Parallelism and workspace pool placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Live worker concurrency limit. Resizable at runtime.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Directory holding the clone pool. Defaults to `<state_dir>/pool`.
    #[serde(default)]
    pub pool_dir: Option<PathBuf>,
    /// Number of clones kept in the pool. Defaults to `num_workers + 1`
    /// so fixup candidates do not starve the main dispatch path.
    #[serde(default)]
    pub max_clones: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            pool_dir: None,
            max_clones: None,
        }
    }
}

/// Dollar budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Per-worker-session ceiling, passed through to the worker environment.
    #[serde(default = "default_session_budget")]
    pub max_per_session_usd: f64,
    /// Whole-mission ceiling; crossing it stops the mission.
    #[serde(default = "default_run_budget")]
    pub max_per_run_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_per_session_usd: default_session_budget(),
            max_per_run_usd: default_run_budget(),
        }
    }
}

/// Epoch-count limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundsConfig {
    /// Hard ceiling on epochs per mission.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Epochs without a `mc/green` advance before the mission stalls out.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            stall_threshold: default_stall_threshold(),
        }
    }
}

/// Continuous-controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousConfig {
    #[serde(default = "default_wall_time")]
    pub max_wall_time_seconds: u64,
    #[serde(default = "default_min_ambition")]
    pub min_ambition_score: f32,
    #[serde(default = "default_max_replans")]
    pub max_replan_attempts: u32,
    /// Run the verification command before promoting each merge.
    #[serde(default = "default_true")]
    pub verify_before_merge: bool,
    /// Queued units older than this are dropped as stale.
    #[serde(default = "default_backlog_max_age")]
    pub backlog_max_age_seconds: u64,
    /// All-fail epochs tolerated before the mission stops.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Sleep after the first all-fail epoch.
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_seconds: u64,
    /// Units requested from the planner per epoch.
    #[serde(default = "default_units_per_epoch")]
    pub max_units_per_epoch: usize,
    /// Optional command probing whether the mission objective is met.
    /// Checked after any epoch that advanced `mc/green`.
    #[serde(default)]
    pub objective_check: Option<String>,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            max_wall_time_seconds: default_wall_time(),
            min_ambition_score: default_min_ambition(),
            max_replan_attempts: default_max_replans(),
            verify_before_merge: true,
            backlog_max_age_seconds: default_backlog_max_age(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_backoff_seconds: default_failure_backoff(),
            max_units_per_epoch: default_units_per_epoch(),
            objective_check: None,
        }
    }
}

/// Green-branch manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreenBranchConfig {
    /// Push `mc/green` to the configured upstream after each promotion.
    #[serde(default)]
    pub auto_push: bool,
    /// Upstream branch name for the push.
    #[serde(default = "default_push_branch")]
    pub push_branch: String,
    /// Remote the push goes to.
    #[serde(default = "default_push_remote")]
    pub push_remote: String,
    #[serde(default)]
    pub auto_push_policy: AutoPushPolicy,
    /// Fixup rounds allowed per unit on top of the original attempt.
    #[serde(default = "default_fixup_attempts")]
    pub fixup_max_attempts: u32,
    /// Parallel fixup candidates per round.
    #[serde(default = "default_fixup_candidates")]
    pub fixup_candidates: usize,
}

impl Default for GreenBranchConfig {
    fn default() -> Self {
        Self {
            auto_push: false,
            push_branch: default_push_branch(),
            push_remote: default_push_remote(),
            auto_push_policy: AutoPushPolicy::default(),
            fixup_max_attempts: default_fixup_attempts(),
            fixup_candidates: default_fixup_candidates(),
        }
    }
}

/// Diff-review gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// External command producing a review block from a diff on stdin.
    /// Empty disables reviewing entirely.
    #[serde(default)]
    pub command: String,
    /// Feed low review scores back into re-planning.
    #[serde(default)]
    pub gate_completion: bool,
    /// Aggregate score below which a unit is flagged for the planner.
    #[serde(default = "default_min_review_score")]
    pub min_review_score: f32,
    /// Skip the review when every acceptance criterion passed.
    #[serde(default)]
    pub skip_when_criteria_passed: bool,
    /// Seconds before the review command is killed.
    #[serde(default = "default_review_timeout")]
    pub timeout: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            gate_completion: false,
            min_review_score: default_min_review_score(),
            skip_when_criteria_passed: false,
            timeout: default_review_timeout(),
        }
    }
}

/// Circuit-breaker thresholds shared by all named components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Consecutive failures before a component's circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before a half-open trial.
    #[serde(default = "default_breaker_reset")]
    pub reset_timeout: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            reset_timeout: default_breaker_reset(),
        }
    }
}

/// External worker backend command.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Command line launched per work unit, in the unit's workspace clone.
    #[serde(default)]
    pub command: String,
}

/// External planner command.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlannerConfig {
    /// Command line producing an epoch plan as JSON on stdout.
    #[serde(default)]
    pub command: String,
    /// Seconds before a planning call is killed.
    #[serde(default = "default_planner_timeout")]
    pub timeout: u64,
}

/// Top-level mission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rounds: RoundsConfig,
    #[serde(default)]
    pub continuous: ContinuousConfig,
    #[serde(default)]
    pub green_branch: GreenBranchConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
}

impl MissionConfig {
    /// Parse a TOML string.
    pub fn from_toml(text: &str) -> ControlResult<Self> {
        toml::from_str(text).map_err(|e| ControlError::config(e.to_string()))
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ControlResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Directory holding the store, pool, integration clone, and changelog.
    pub fn state_dir(&self) -> PathBuf {
        self.target.path.join(".mission-control")
    }

    /// Resolved pool directory.
    pub fn pool_dir(&self) -> PathBuf {
        self.scheduler
            .parallel
            .pool_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("pool"))
    }

    /// Resolved clone count for the pool.
    pub fn max_clones(&self) -> usize {
        self.scheduler
            .parallel
            .max_clones
            .unwrap_or(self.scheduler.parallel.num_workers + 1)
    }

    /// Minimal configuration against a target path, used by tests.
    pub fn for_target(path: impl Into<PathBuf>) -> Self {
        Self {
            target: TargetConfig {
                path: path.into(),
                branch: default_branch(),
                verification: VerificationConfig::default(),
            },
            scheduler: SchedulerConfig::default(),
            rounds: RoundsConfig::default(),
            continuous: ContinuousConfig::default(),
            green_branch: GreenBranchConfig::default(),
            review: ReviewConfig::default(),
            degradation: DegradationConfig::default(),
            worker: WorkerConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_verify_timeout() -> u64 {
    300
}
fn default_session_timeout() -> u64 {
    1800
}
fn default_num_workers() -> usize {
    2
}
fn default_session_budget() -> f64 {
    5.0
}
fn default_run_budget() -> f64 {
    50.0
}
fn default_max_rounds() -> u32 {
    50
}
fn default_stall_threshold() -> u32 {
    5
}
fn default_wall_time() -> u64 {
    4 * 3600
}
fn default_min_ambition() -> f32 {
    5.0
}
fn default_max_replans() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_backlog_max_age() -> u64 {
    24 * 3600
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_failure_backoff() -> u64 {
    60
}
fn default_units_per_epoch() -> usize {
    6
}
fn default_push_branch() -> String {
    "mc/green".to_string()
}
fn default_push_remote() -> String {
    "upstream".to_string()
}
fn default_fixup_attempts() -> u32 {
    2
}
fn default_fixup_candidates() -> usize {
    3
}
fn default_min_review_score() -> f32 {
    6.0
}
fn default_review_timeout() -> u64 {
    120
}
fn default_breaker_threshold() -> u32 {
    3
}
fn default_breaker_reset() -> u64 {
    60
}
fn default_planner_timeout() -> u64 {
    300
}
