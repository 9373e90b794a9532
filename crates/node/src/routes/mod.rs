pub mod bus;
pub mod health;
pub mod metrics;
pub mod queues;

use std::sync::Arc;

use event_bus::{EventBus, MessageQueue};
use event_store::EventStore;

/// Shared state for the operational endpoints.
pub struct AppState<S: EventStore> {
    pub bus: Arc<EventBus<S>>,
    pub queues: Arc<MessageQueue>,
}
