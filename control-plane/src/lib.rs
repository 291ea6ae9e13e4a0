//! Control plane for autonomous development missions.
//!
//! This library is the continuous controller plus integration plane of
//! the mission driver:
//! - the epoch scheduler that selects, orders, and dispatches work units
//!   under dependency, file-overlap, and capacity constraints
//! - the green-branch manager that serialises worker output into
//!   `mc/working` and promotes verified merges to `mc/green`
//! - the resource substrate: workspace clone pool, per-component circuit
//!   breakers, and the EMA cost budget
//! - the quality gates: ambition gate, acceptance criteria, fixup
//!   tournament, and the non-blocking diff reviewer
//!
//! Workers and planners are external collaborators behind the
//! [`worker::WorkerBackend`] and [`planner::Planner`] traits.

pub mod breaker;
pub mod budget;
pub mod changelog;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gitops;
pub mod green;
pub mod limits;
pub mod planner;
pub mod queue;
pub mod review;
pub mod store;
pub mod verify;
pub mod worker;
pub mod workspace;

// Re-export the error spine
pub use error::{ControlError, ControlResult, FailureClass};

// Re-export configuration types
pub use config::{AutoPushPolicy, MissionConfig};

// Re-export store types
pub use store::{
    BacklogItem, ContextItem, Epoch, Mission, MissionStatus, MissionStore, Reflection,
    ReviewRecord, SharedStore, StopReason, UnitState, WorkUnit,
};

// Re-export event types
pub use events::{EventBus, MissionEvent, SharedEventBus};

// Re-export resource substrate
pub use breaker::{CircuitBreakerSet, CircuitState, Outcome};
pub use budget::EmaBudget;
pub use limits::{WorkerLimiter, WorkerPermit};
pub use workspace::{WorkspaceHandle, WorkspacePool};

// Re-export the integration plane
pub use green::{GreenBranchManager, ProcessOutcome, PushStatus, GREEN_BRANCH, WORKING_BRANCH};
pub use queue::{MergeQueue, MergeQueueConsumer, MergeSubmission};

// Re-export external-collaborator seams
pub use planner::{CommandPlanner, EpochPlan, PlanContext, Planner};
pub use review::{DiffReviewer, REVIEW_MARKER};
pub use worker::{
    LocalProcessBackend, McResult, ResultEnvelope, WorkerBackend, WorkerRequest, MC_RESULT_BEGIN,
    MC_RESULT_END,
};

// Re-export the controller
pub use controller::{ContinuousController, MissionOutcome};
