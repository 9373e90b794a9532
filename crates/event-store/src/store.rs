use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::{
    AggregateId, EventEnvelope, EventMetadata, EventQuery, EventStoreError, Result, Snapshot,
    StoredEvent, Version,
};

/// A stream of stored events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StoredEvent>> + Send>>;

/// One page of an aggregate's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStreamPage {
    pub events: Vec<StoredEvent>,

    /// The version the page was requested from.
    pub from_version: Version,

    /// The highest version among `events`, or `from_version` when the page is empty.
    pub to_version: Version,

    /// Whether the stream continues past `to_version`.
    pub has_more: bool,
}

/// Core trait for event store implementations.
///
/// An event store is an append-only log of events partitioned into one
/// stream per aggregate. All implementations must be thread-safe.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to an aggregate's stream.
    ///
    /// Fails with `ConcurrencyConflict` when the stored version differs from
    /// `expected_version`. On success the events are stored with stream
    /// versions `expected_version + 1 ..= expected_version + events.len()`
    /// and the new records are returned. The version check and the append
    /// happen atomically.
    async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        expected_version: Version,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns events with versions in `[from_version, to_version]`, in version order.
    ///
    /// The range is unbounded above when `to_version` is `None`.
    async fn get_events(
        &self,
        aggregate_id: &AggregateId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns at most `limit` events starting at `from_version`.
    async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: Version,
        limit: usize,
    ) -> Result<EventStreamPage>;

    /// Returns events of one type in the order they were stored.
    async fn get_events_by_type(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns events saved with the given tenant in their metadata.
    async fn get_events_by_tenant(
        &self,
        tenant_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>>;

    /// Returns events matching a combined query, in the order they were stored.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>>;

    /// Streams every stored event in the order it was stored.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Returns the aggregate's current version, or `Version::initial()` if unknown.
    async fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> Result<Version>;

    /// Stores a snapshot, replacing any existing one for the aggregate.
    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    async fn get_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>>;

    /// Removes the aggregate's snapshot. Returns whether one existed.
    async fn delete_snapshot(&self, aggregate_id: &AggregateId) -> Result<bool>;

    /// Checks for a stored event by its store-assigned id.
    async fn event_exists(&self, event_id: &str) -> Result<bool>;

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<StoredEvent>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event.
    async fn save_event(
        &self,
        event: EventEnvelope,
        expected_version: Version,
        metadata: Option<EventMetadata>,
    ) -> Result<StoredEvent> {
        let aggregate_id = event.aggregate_id.clone();
        let mut stored = self
            .save_events(&aggregate_id, vec![event], expected_version, metadata)
            .await?;
        stored
            .pop()
            .ok_or_else(|| EventStoreError::validation("store returned no record for the event"))
    }

    /// Checks if an aggregate has any events.
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self.get_aggregate_version(aggregate_id).await? > Version::initial())
    }

    /// Loads an aggregate's snapshot (if any) and the events recorded after it.
    async fn load_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<(Option<Snapshot>, Vec<StoredEvent>)> {
        if let Some(snapshot) = self.get_snapshot(aggregate_id).await? {
            let events = self
                .get_events(aggregate_id, snapshot.version.next(), None)
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.get_events(aggregate_id, Version::first(), None).await?;
            Ok((None, events))
        }
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a save request before the version check.
///
/// The aggregate id must be set, the batch non-empty, every event well formed
/// and owned by `aggregate_id`, and versions sequential within the batch,
/// starting right after `expected_version`.
pub fn validate_save_request(
    aggregate_id: &AggregateId,
    events: &[EventEnvelope],
    expected_version: Version,
) -> Result<()> {
    if aggregate_id.is_empty() {
        return Err(EventStoreError::validation("aggregate id is required"));
    }
    if expected_version < Version::initial() {
        return Err(EventStoreError::validation(format!(
            "expected version must not be negative, got {expected_version}"
        )));
    }
    let Some(first) = events.first() else {
        return Err(EventStoreError::validation("cannot save an empty event list"));
    };

    let mut previous: Option<Version> = None;
    for event in events {
        event.validate()?;
        if &event.aggregate_id != aggregate_id {
            return Err(EventStoreError::validation(format!(
                "event {} belongs to aggregate {}, not {aggregate_id}",
                event.event_id, event.aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::validation(
                "all events must have the same aggregate type",
            ));
        }
        if let Some(previous) = previous
            && event.version != previous.next()
        {
            return Err(EventStoreError::validation(format!(
                "event versions must be sequential: expected {}, got {}",
                previous.next(),
                event.version
            )));
        }
        previous = Some(event.version);
    }

    if first.version != expected_version.next() {
        return Err(EventStoreError::validation(format!(
            "first event version {} does not follow expected version {expected_version}",
            first.version
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: &str, version: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("User")
            .event_type("UserCreated")
            .version(Version::new(version))
            .build()
    }

    #[test]
    fn accepts_sequential_batch() {
        let id = AggregateId::from("u1");
        let events = vec![event("u1", 1), event("u1", 2)];
        assert!(validate_save_request(&id, &events, Version::initial()).is_ok());
    }

    #[test]
    fn rejects_empty_batch() {
        let id = AggregateId::from("u1");
        let err = validate_save_request(&id, &[], Version::initial()).unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
    }

    #[test]
    fn rejects_blank_aggregate_id() {
        let id = AggregateId::from("");
        assert!(validate_save_request(&id, &[event("", 1)], Version::initial()).is_err());
    }

    #[test]
    fn rejects_mixed_aggregates() {
        let id = AggregateId::from("u1");
        let events = vec![event("u1", 1), event("u2", 2)];
        assert!(validate_save_request(&id, &events, Version::initial()).is_err());
    }

    #[test]
    fn rejects_negative_expected_version() {
        let id = AggregateId::from("u1");
        assert!(validate_save_request(&id, &[event("u1", 1)], Version::new(-1)).is_err());
    }

    #[test]
    fn rejects_batch_not_following_expected_version() {
        let id = AggregateId::from("u1");
        let err = validate_save_request(&id, &[event("u1", 1)], Version::first()).unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
        assert!(validate_save_request(&id, &[event("u1", 2)], Version::first()).is_ok());
    }

    #[test]
    fn rejects_version_gaps() {
        let id = AggregateId::from("u1");
        let events = vec![event("u1", 1), event("u1", 3)];
        assert!(validate_save_request(&id, &events, Version::initial()).is_err());
    }
}
