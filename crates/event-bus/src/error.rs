//! Error types for the event bus, message queues and handlers.

use std::time::Duration;

use event_store::EventStoreError;
use thiserror::Error;

use crate::subscription::SubscriptionId;

/// Errors returned by [`EventBus`](crate::EventBus) operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Event bus is not running")]
    NotRunning,

    /// The caller passed an event or subscription that cannot be accepted.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

impl BusError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Errors returned by [`MessageQueue`](crate::MessageQueue) operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid queue name: {0:?}")]
    InvalidName(String),
}

/// Errors raised by event and message handlers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The event is not one this handler can process.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    /// Creates a `Failed` error from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
