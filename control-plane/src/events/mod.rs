//! Typed mission events and the broadcast bus that carries them.

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::MissionEvent;
