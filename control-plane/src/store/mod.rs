//! Durable mission state: record types, column family layout, and the
//! RocksDB-backed store.

pub mod schema;
#[allow(clippy::module_inception)]
pub mod store;
pub mod types;

pub use store::{MissionStore, SharedStore, StoreError, StoreResult};
pub use types::{
    BacklogItem, ContextItem, Epoch, Mission, MissionStatus, Reflection, ReviewRecord, StopReason,
    UnitState, WorkUnit,
};
