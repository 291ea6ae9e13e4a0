//! Column family layout for the mission store.
//!
//! Each record type gets its own column family; compound keys carry a
//! short prefix so prefix scans stay cheap.

/// Column family for missions
pub const CF_MISSIONS: &str = "missions";

/// Column family for epochs
pub const CF_EPOCHS: &str = "epochs";

/// Column family for work units
pub const CF_UNITS: &str = "units";

/// Column family for backlog items
pub const CF_BACKLOG: &str = "backlog";

/// Column family for context items
pub const CF_CONTEXT: &str = "context";

/// Column family for review records
pub const CF_REVIEWS: &str = "reviews";

/// Column family for epoch reflections
pub const CF_REFLECTIONS: &str = "reflections";

/// Column family for the persisted event stream
pub const CF_EVENTS: &str = "events";

/// Column family for schema metadata
pub const CF_META: &str = "meta";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_MISSIONS,
    CF_EPOCHS,
    CF_UNITS,
    CF_BACKLOG,
    CF_CONTEXT,
    CF_REVIEWS,
    CF_REFLECTIONS,
    CF_EVENTS,
    CF_META,
];

/// Current schema version. Bumped with every migration step.
pub const SCHEMA_VERSION: u32 = 1;

/// Meta key holding the applied schema version.
pub const META_SCHEMA_VERSION: &str = "schema_version";

/// Key construction for compound keys
pub mod keys {
    /// Create a mission key
    pub fn mission(mission_id: &str) -> String {
        format!("msn:{mission_id}")
    }

    /// Create an epoch key, ordered within its mission
    pub fn epoch(mission_id: &str, ordinal: u32) -> String {
        format!("epo:{mission_id}:{ordinal:06}")
    }

    /// Create a work-unit key
    pub fn unit(unit_id: &str) -> String {
        format!("unit:{unit_id}")
    }

    /// Create a backlog key
    pub fn backlog(item_id: &str) -> String {
        format!("bkl:{item_id}")
    }

    /// Create a context-item key
    pub fn context(mission_id: &str, item_id: &str) -> String {
        format!("ctx:{mission_id}:{item_id}")
    }

    /// Create a review key
    pub fn review(unit_id: &str) -> String {
        format!("rev:{unit_id}")
    }

    /// Create a reflection key, ordered within its mission
    pub fn reflection(mission_id: &str, epoch_ordinal: u32) -> String {
        format!("rfl:{mission_id}:{epoch_ordinal:06}")
    }

    /// Create an event key (timestamp-ordered)
    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        format!("evt:{timestamp_nanos:020}:{event_id}")
    }

    /// Parse event timestamp from key
    pub fn parse_event_timestamp(key: &str) -> Option<i64> {
        let mut parts = key.split(':');
        if parts.next() == Some("evt") {
            parts.next()?.parse().ok()
        } else {
            None
        }
    }
}
