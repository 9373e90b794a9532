use std::sync::Arc;

use async_trait::async_trait;
use event_store::StoredEvent;
use serde_json::json;

use crate::error::HandlerError;
use crate::handler::EventHandler;
use crate::queue::{DEFAULT_MESSAGE_PRIORITY, Message, MessageQueue};

/// Subscribes to one event type on the bus and hands each event to a named
/// queue as a [`DomainEvent`](crate::MessageKind::DomainEvent) message.
///
/// The message body is the stored event's serialized data. The stored event
/// id, aggregate id, event type and any tenant or correlation id travel in
/// the message metadata.
pub struct QueueForwarder {
    name: String,
    event_type: String,
    queue: Arc<MessageQueue>,
    queue_name: String,
    priority: i32,
}

impl QueueForwarder {
    /// Creates a forwarder from `event_type` bus events into `queue_name`.
    pub fn new(
        event_type: impl Into<String>,
        queue: Arc<MessageQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        let event_type = event_type.into();
        let queue_name = queue_name.into();
        Self {
            name: format!("forward:{event_type}->{queue_name}"),
            event_type,
            queue,
            queue_name,
            priority: DEFAULT_MESSAGE_PRIORITY,
        }
    }

    /// Priority given to forwarded messages.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl EventHandler for QueueForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn process_event(&self, event: &StoredEvent) -> Result<(), HandlerError> {
        let mut message = Message::domain_event(event.event_data.clone())
            .with_priority(self.priority)
            .with_metadata("stored_event_id", json!(event.id()))
            .with_metadata("aggregate_id", json!(event.aggregate_id().as_str()))
            .with_metadata("event_type", json!(event.event_type()));
        if let Some(tenant_id) = &event.metadata.tenant_id {
            message = message.with_metadata("tenant_id", json!(tenant_id));
        }
        if let Some(correlation_id) = &event.metadata.correlation_id {
            message = message.with_metadata("correlation_id", json!(correlation_id));
        }

        self.queue
            .publish(&self.queue_name, message)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}
