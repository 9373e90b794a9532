use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SharedClock, system_clock};
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventMetadata, EventQuery, EventStoreError, Result, Snapshot,
    StoredEvent, Version,
    query::within_range,
    store::{EventStore, EventStream, EventStreamPage, validate_save_request},
};

/// Log plus the secondary indexes over it. Indexes hold positions into `log`.
#[derive(Default)]
struct StoreState {
    log: Vec<StoredEvent>,
    streams: HashMap<AggregateId, Vec<usize>>,
    by_id: HashMap<String, usize>,
    by_type: HashMap<String, Vec<usize>>,
    by_tenant: HashMap<String, Vec<usize>>,
    versions: HashMap<AggregateId, Version>,
    snapshots: HashMap<AggregateId, Snapshot>,
}

impl StoreState {
    fn version_of(&self, aggregate_id: &AggregateId) -> Version {
        self.versions
            .get(aggregate_id)
            .copied()
            .unwrap_or(Version::initial())
    }

    fn push(&mut self, event: StoredEvent) {
        let position = self.log.len();
        self.streams
            .entry(event.aggregate_id().clone())
            .or_default()
            .push(position);
        self.by_id.insert(event.id(), position);
        self.by_type
            .entry(event.event_type().to_string())
            .or_default()
            .push(position);
        if let Some(tenant) = event.tenant_id() {
            self.by_tenant
                .entry(tenant.to_string())
                .or_default()
                .push(position);
        }
        self.log.push(event);
    }

    fn stream(&self, aggregate_id: &AggregateId) -> impl Iterator<Item = &StoredEvent> {
        self.streams
            .get(aggregate_id)
            .into_iter()
            .flatten()
            .map(|&position| &self.log[position])
    }

    fn scan_index(
        &self,
        positions: Option<&Vec<usize>>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<StoredEvent> {
        positions
            .into_iter()
            .flatten()
            .map(|&position| &self.log[position])
            .filter(|event| within_range(event.occurred_on(), from, to))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// In-memory event store.
///
/// Keeps one ordered stream per aggregate, a global log in insertion order,
/// and id/type/tenant indexes. The version check and the append run under the
/// same write guard, so concurrent saves to one aggregate cannot both succeed.
#[derive(Clone)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<StoreState>>,
    clock: SharedClock,
}

impl InMemoryEventStore {
    /// Creates a new empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Creates a new empty store that stamps `stored_at` from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            clock,
        }
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.log.len()
    }

    /// Clears all events, versions and snapshots.
    pub async fn clear(&self) {
        *self.state.write().await = StoreState::default();
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(
        skip(self, events, metadata),
        fields(aggregate_id = %aggregate_id, event_count = events.len())
    )]
    async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        expected_version: Version,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>> {
        validate_save_request(aggregate_id, &events, expected_version)?;
        let metadata = metadata.unwrap_or_default();

        let mut state = self.state.write().await;

        let actual = state.version_of(aggregate_id);
        if actual != expected_version {
            metrics::counter!("event_store_concurrency_conflicts_total").increment(1);
            tracing::warn!(expected = %expected_version, %actual, "concurrency conflict");
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        let stored_at = self.clock.now();
        let mut stored = Vec::with_capacity(events.len());
        for (index, envelope) in events.into_iter().enumerate() {
            let event_data = envelope.to_json()?;
            stored.push(StoredEvent {
                envelope,
                event_data,
                metadata: metadata.clone(),
                stored_at,
                stream_version: expected_version.advanced_by(index + 1),
            });
        }

        for event in &stored {
            state.push(event.clone());
        }
        let new_version = expected_version.advanced_by(stored.len());
        state.versions.insert(aggregate_id.clone(), new_version);

        metrics::counter!("event_store_events_appended_total").increment(stored.len() as u64);
        tracing::debug!(%new_version, "events appended");

        Ok(stored)
    }

    async fn get_events(
        &self,
        aggregate_id: &AggregateId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<Vec<StoredEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .stream(aggregate_id)
            .filter(|e| e.version() >= from_version && to_version.is_none_or(|to| e.version() <= to))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version());
        Ok(events)
    }

    async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: Version,
        limit: usize,
    ) -> Result<EventStreamPage> {
        let mut remaining = self.get_events(aggregate_id, from_version, None).await?;
        let has_more = remaining.len() > limit;
        remaining.truncate(limit);
        let to_version = remaining.last().map_or(from_version, |e| e.version());

        Ok(EventStreamPage {
            events: remaining,
            from_version,
            to_version,
            has_more,
        })
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>> {
        let state = self.state.read().await;
        Ok(state.scan_index(state.by_type.get(event_type), from, to, limit))
    }

    async fn get_events_by_tenant(
        &self,
        tenant_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>> {
        let state = self.state.read().await;
        Ok(state.scan_index(state.by_tenant.get(tenant_id), from, to, limit))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<StoredEvent>> {
        let state = self.state.read().await;
        let events = state
            .log
            .iter()
            .filter(|e| query.matches(e))
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(events)
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.state.read().await.log.clone();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        Ok(self.state.read().await.version_of(aggregate_id))
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        if snapshot.aggregate_id.is_empty() {
            return Err(EventStoreError::Validation(
                "snapshot aggregate id is required".to_string(),
            ));
        }
        if snapshot.version < Version::initial() {
            return Err(EventStoreError::Validation(format!(
                "snapshot version must not be negative, got {}",
                snapshot.version
            )));
        }
        let mut state = self.state.write().await;
        state
            .snapshots
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.state.read().await.snapshots.get(aggregate_id).cloned())
    }

    async fn delete_snapshot(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .snapshots
            .remove(aggregate_id)
            .is_some())
    }

    async fn event_exists(&self, event_id: &str) -> Result<bool> {
        Ok(self.state.read().await.by_id.contains_key(event_id))
    }

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        let state = self.state.read().await;
        Ok(state
            .by_id
            .get(event_id)
            .map(|&position| state.log[position].clone()))
    }
}
