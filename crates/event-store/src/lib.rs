//! Append-only event store.
//!
//! Events are kept in one stream per aggregate and appended under optimistic
//! concurrency control: a save names the version it expects the stream to be
//! at, and fails with [`EventStoreError::ConcurrencyConflict`] if another
//! writer got there first.

pub mod error;
pub mod event;
pub mod memory;
pub mod query;
pub mod snapshot;
pub mod store;
pub mod stored;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use query::EventQuery;
pub use snapshot::Snapshot;
pub use store::{EventStore, EventStoreExt, EventStream, EventStreamPage};
pub use stored::{EventMetadata, StoredEvent, stored_event_id};
