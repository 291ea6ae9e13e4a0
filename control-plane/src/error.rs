//! Control-plane error types.
//!
//! One error enum for the whole library, with a failure classification
//! used by the controller and the green-branch manager to decide between
//! retry, fixup escalation, abandonment, and mission halt.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, git lock contention, network hiccups. Retried with backoff.
    Transient,
    /// Merge conflicts, verification and acceptance failures. Escalate to fixup.
    Content,
    /// Diverged refs, corrupted workspace, store invariant violation. Halt the submission.
    Integrity,
    /// Cost or wall-time exhausted. Terminal for the mission.
    Budget,
    /// Malformed worker envelope or review block. Degraded signal only.
    Parse,
}

/// Errors that can occur inside the controller and integration plane
#[derive(Error, Debug)]
pub enum ControlError {
    /// Git operation failed
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    /// External command exceeded its timeout
    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    /// Merge conflict while integrating a worker branch
    #[error("merge conflict integrating unit {unit_id}")]
    MergeConflict { unit_id: String },

    /// Verification command returned non-zero
    #[error("verification failed for unit {unit_id}: {detail}")]
    VerificationFailed { unit_id: String, detail: String },

    /// An acceptance criterion returned non-zero
    #[error("acceptance criterion failed for unit {unit_id}: `{criterion}`")]
    AcceptanceFailed { unit_id: String, criterion: String },

    /// Integration refs are not where they must be
    #[error("integrity violation: {message}")]
    Integrity { message: String },

    /// Mission budget exhausted
    #[error("budget exhausted: {reason}")]
    Budget { reason: String },

    /// Worker envelope or review block could not be parsed
    #[error("parse failure in {what}: {message}")]
    Parse { what: String, message: String },

    /// Workspace pool could not hand out a clone in time
    #[error("no workspace clone available within {seconds}s")]
    WorkspaceExhausted { seconds: u64 },

    /// Workspace directory is unusable
    #[error("workspace at {path} is corrupted: {message}")]
    WorkspaceCorrupted { path: PathBuf, message: String },

    /// Planner interface failure
    #[error("planner error: {0}")]
    Planner(String),

    /// Worker backend failure (spawn, kill, wait)
    #[error("worker backend error: {0}")]
    Worker(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable store failure
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// IO error wrapper
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error wrapper
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Classify this error for retry/escalation decisions
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Git { message, .. } if is_transient_git(message) => FailureClass::Transient,
            Self::Timeout { .. } | Self::WorkspaceExhausted { .. } => FailureClass::Transient,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut => FailureClass::Transient,
                _ => FailureClass::Integrity,
            },
            Self::MergeConflict { .. }
            | Self::VerificationFailed { .. }
            | Self::AcceptanceFailed { .. } => FailureClass::Content,
            Self::Budget { .. } => FailureClass::Budget,
            Self::Parse { .. } | Self::Json(_) => FailureClass::Parse,
            Self::Git { .. }
            | Self::Integrity { .. }
            | Self::WorkspaceCorrupted { .. }
            | Self::Store(_)
            | Self::Config(_)
            | Self::Planner(_)
            | Self::Worker(_) => FailureClass::Integrity,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Transient
    }

    /// Short kind label for changelog lines
    pub fn kind_label(&self) -> &'static str {
        match self.classify() {
            FailureClass::Transient => "transient",
            FailureClass::Content => "content",
            FailureClass::Integrity => "integrity",
            FailureClass::Budget => "budget",
            FailureClass::Parse => "parse",
        }
    }
}

/// Git failures that clear up on retry: lock files, concurrent processes,
/// flaky transport.
fn is_transient_git(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("lock")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("could not lock")
        || lower.contains("another git process")
}
