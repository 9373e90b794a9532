//! Shared types for the event-sourcing core.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, instant_after, system_clock};
pub use types::AggregateId;
