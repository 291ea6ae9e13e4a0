//! Mission lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StopReason;

/// Everything observable about a running mission, published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionEvent {
    MissionStarted {
        mission_id: String,
        objective: String,
        timestamp: DateTime<Utc>,
    },
    EpochStarted {
        mission_id: String,
        ordinal: u32,
        planned_units: usize,
        ambition_score: f32,
        timestamp: DateTime<Utc>,
    },
    UnitDispatched {
        mission_id: String,
        unit_id: String,
        epoch_ordinal: u32,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    UnitMerged {
        mission_id: String,
        unit_id: String,
        timestamp: DateTime<Utc>,
    },
    UnitRolledBack {
        mission_id: String,
        unit_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    UnitCompleted {
        mission_id: String,
        unit_id: String,
        timestamp: DateTime<Utc>,
    },
    GreenAdvanced {
        mission_id: String,
        sha: String,
        timestamp: DateTime<Utc>,
    },
    EpochEnded {
        mission_id: String,
        ordinal: u32,
        merged_units: u32,
        failed_units: u32,
        cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
    MissionStopped {
        mission_id: String,
        reason: StopReason,
        total_cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
}

impl MissionEvent {
    /// Short label for logging and filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MissionStarted { .. } => "mission_started",
            Self::EpochStarted { .. } => "epoch_started",
            Self::UnitDispatched { .. } => "unit_dispatched",
            Self::UnitMerged { .. } => "unit_merged",
            Self::UnitRolledBack { .. } => "unit_rolled_back",
            Self::UnitCompleted { .. } => "unit_completed",
            Self::GreenAdvanced { .. } => "green_advanced",
            Self::EpochEnded { .. } => "epoch_ended",
            Self::MissionStopped { .. } => "mission_stopped",
        }
    }

    /// The event's wall-clock timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::MissionStarted { timestamp, .. }
            | Self::EpochStarted { timestamp, .. }
            | Self::UnitDispatched { timestamp, .. }
            | Self::UnitMerged { timestamp, .. }
            | Self::UnitRolledBack { timestamp, .. }
            | Self::UnitCompleted { timestamp, .. }
            | Self::GreenAdvanced { timestamp, .. }
            | Self::EpochEnded { timestamp, .. }
            | Self::MissionStopped { timestamp, .. } => *timestamp,
        }
    }

    /// Mission this event belongs to.
    pub fn mission_id(&self) -> &str {
        match self {
            Self::MissionStarted { mission_id, .. }
            | Self::EpochStarted { mission_id, .. }
            | Self::UnitDispatched { mission_id, .. }
            | Self::UnitMerged { mission_id, .. }
            | Self::UnitRolledBack { mission_id, .. }
            | Self::UnitCompleted { mission_id, .. }
            | Self::GreenAdvanced { mission_id, .. }
            | Self::EpochEnded { mission_id, .. }
            | Self::MissionStopped { mission_id, .. } => mission_id,
        }
    }

    /// Unit this event concerns, if any.
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Self::UnitDispatched { unit_id, .. }
            | Self::UnitMerged { unit_id, .. }
            | Self::UnitRolledBack { unit_id, .. }
            | Self::UnitCompleted { unit_id, .. } => Some(unit_id),
            _ => None,
        }
    }

    /// Fresh event id for persistence keys.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let ev = MissionEvent::UnitMerged {
            mission_id: "m-1".into(),
            unit_id: "u-1".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(ev.event_type(), "unit_merged");
        assert_eq!(ev.mission_id(), "m-1");
        assert_eq!(ev.unit_id(), Some("u-1"));

        let ev = MissionEvent::GreenAdvanced {
            mission_id: "m-1".into(),
            sha: "abc123".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(ev.unit_id(), None);
    }

    #[test]
    fn test_event_json_round_trip() {
        let ev = MissionEvent::MissionStopped {
            mission_id: "m-1".into(),
            reason: StopReason::CostBudget,
            total_cost_usd: 12.5,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("mission_stopped"));
        assert!(json.contains("cost_budget"));
        let back: MissionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "mission_stopped");
    }
}
