//! Per-component circuit breakers.
//!
//! Each named component (worker backend, green branch, reviewer, planner)
//! gets an independent three-state machine: `Closed` passes calls
//! through, `Open` short-circuits them for `reset_timeout`, and
//! `HalfOpen` admits a single trial call whose outcome decides between
//! the two.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Circuit state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls blocked until the reset timeout expires.
    Open,
    /// Cooldown expired, one probe call allowed.
    HalfOpen,
}

/// Outcome of a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open trial is in flight; further calls blocked until its
    /// outcome is recorded.
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of one component's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Set of independent per-component circuit breakers.
pub struct CircuitBreakerSet {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerSet {
    /// Create a breaker set. Every component trips after
    /// `failure_threshold` consecutive failures and probes again after
    /// `reset_timeout`.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether a call to `component` may proceed right now.
    ///
    /// In `HalfOpen` the first caller claims the trial slot; subsequent
    /// callers are blocked until the trial's outcome is recorded.
    pub fn allow(&self, component: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        match self.state_of(breaker) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of a call to `component`.
    pub fn record(&self, component: &str, outcome: Outcome) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);
        breaker.trial_in_flight = false;

        match outcome {
            Outcome::Success => {
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
            }
            Outcome::Failure => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.failure_threshold {
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Current state of `component`'s circuit.
    pub fn state(&self, component: &str) -> CircuitState {
        let breakers = self.breakers.lock().expect("breaker lock");
        breakers
            .get(component)
            .map_or(CircuitState::Closed, |b| self.state_of(b))
    }

    /// Snapshot of every known component.
    pub fn summary(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock().expect("breaker lock");
        breakers
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    BreakerSnapshot {
                        state: self.state_of(b),
                        consecutive_failures: b.consecutive_failures,
                    },
                )
            })
            .collect()
    }

    fn state_of(&self, breaker: &Breaker) -> CircuitState {
        if breaker.consecutive_failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        match breaker.opened_at {
            Some(opened) if opened.elapsed() >= self.reset_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
            // Threshold reached but no open timestamp: treat as open now.
            None => CircuitState::Open,
        }
    }
}

/// Component name guarded for worker dispatch.
pub const COMPONENT_WORKER: &str = "worker";
/// Component name guarded for green-branch git plumbing.
pub const COMPONENT_GREEN_BRANCH: &str = "green_branch";
/// Component name guarded for the diff reviewer.
pub const COMPONENT_REVIEW: &str = "review";
/// Component name guarded for planner calls.
pub const COMPONENT_PLANNER: &str = "planner";

#[cfg(test)]
mod tests {
    use super::*;

    fn set(threshold: u32, reset_secs: u64) -> CircuitBreakerSet {
        CircuitBreakerSet::new(threshold, Duration::from_secs(reset_secs))
    }

    #[test]
    fn test_starts_closed() {
        let cb = set(3, 60);
        assert_eq!(cb.state("worker"), CircuitState::Closed);
        assert!(cb.allow("worker"));
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = set(2, 9999);
        cb.record("worker", Outcome::Failure);
        assert_eq!(cb.state("worker"), CircuitState::Closed);
        cb.record("worker", Outcome::Failure);
        assert_eq!(cb.state("worker"), CircuitState::Open);
        assert!(!cb.allow("worker"));
    }

    #[test]
    fn test_success_resets() {
        let cb = set(2, 9999);
        cb.record("green_branch", Outcome::Failure);
        cb.record("green_branch", Outcome::Failure);
        assert_eq!(cb.state("green_branch"), CircuitState::Open);
        cb.record("green_branch", Outcome::Success);
        assert_eq!(cb.state("green_branch"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let cb = set(1, 0);
        cb.record("review", Outcome::Failure);
        assert_eq!(cb.state("review"), CircuitState::HalfOpen);
        assert!(cb.allow("review"));
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = set(1, 0);
        cb.record("worker", Outcome::Failure);
        // First caller claims the trial, second is blocked.
        assert!(cb.allow("worker"));
        assert!(!cb.allow("worker"));
        // Trial failure reopens the circuit.
        cb.record("worker", Outcome::Failure);
        // Zero cooldown means immediately half-open again.
        assert_eq!(cb.state("worker"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_trial_success_closes() {
        let cb = set(1, 0);
        cb.record("worker", Outcome::Failure);
        assert!(cb.allow("worker"));
        cb.record("worker", Outcome::Success);
        assert_eq!(cb.state("worker"), CircuitState::Closed);
        assert!(cb.allow("worker"));
    }

    #[test]
    fn test_components_are_independent() {
        let cb = set(1, 9999);
        cb.record("worker", Outcome::Failure);
        assert_eq!(cb.state("worker"), CircuitState::Open);
        assert_eq!(cb.state("green_branch"), CircuitState::Closed);
        assert!(cb.allow("green_branch"));
    }

    #[test]
    fn test_summary() {
        let cb = set(1, 9999);
        cb.record("worker", Outcome::Failure);
        cb.record("planner", Outcome::Success);

        let summary = cb.summary();
        assert_eq!(summary["worker"].state, CircuitState::Open);
        assert_eq!(summary["worker"].consecutive_failures, 1);
        assert_eq!(summary["planner"].state, CircuitState::Closed);
    }
}
