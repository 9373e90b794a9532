//! In-process event dispatch.
//!
//! [`EventBus`] appends events to an [`EventStore`](event_store::EventStore)
//! and fans them out to subscribed [`EventHandler`]s. [`MessageQueue`] is a
//! lower-level set of named priority queues. Both retry with the same
//! [`RetryPolicy`] and hold future work in the same [`DelayedQueue`];
//! [`QueueForwarder`] bridges bus subscriptions into queues.

pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod stats;
pub mod subscription;

pub use bus::EventBus;
pub use config::EventBusConfig;
pub use dead_letter::DeadLetter;
pub use error::{BusError, HandlerError, QueueError, Result};
pub use forwarder::QueueForwarder;
pub use handler::{EventHandler, ProcessingContext, ProcessingResult};
pub use queue::{
    FailedJob, Message, MessageHandler, MessageKind, MessageQueue, ProcessOutcome, QueueConfig,
    QueueStats,
};
pub use retry::RetryPolicy;
pub use schedule::DelayedQueue;
pub use stats::BusStatistics;
pub use subscription::{DEFAULT_PRIORITY, SubscriptionId, SubscriptionInfo, SubscriptionOptions};
