//! Loading and saving aggregates through an event store.

use std::marker::PhantomData;

use common::{AggregateId, SharedClock, system_clock};
use event_store::{EventMetadata, EventStore, EventStoreExt, StoredEvent, Version};

use crate::aggregate::{Aggregate, AggregateRoot, SnapshotCapable};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after its new events were committed.
    pub aggregate: AggregateRoot<A>,

    /// The records the store created for the new events.
    pub events: Vec<StoredEvent>,

    pub new_version: Version,
}

/// Loads aggregates by replaying their streams and saves their uncommitted
/// events with optimistic concurrency.
///
/// A command runs as load, mutate, save. If another writer saved to the same
/// aggregate in between, the save fails with a concurrency conflict and the
/// caller decides whether to reload and retry.
pub struct AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    clock: SharedClock,
    _phantom: PhantomData<A>,
}

impl<S, A> AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a repository over `store`.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, system_clock())
    }

    /// Creates a repository whose aggregates timestamp events from `clock`.
    pub fn with_clock(store: S, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate by replaying its full stream.
    ///
    /// An unknown id yields an empty aggregate at version 0.
    pub async fn load(&self, aggregate_id: &AggregateId) -> Result<AggregateRoot<A>, DomainError> {
        let events = self
            .store
            .get_events(aggregate_id, Version::first(), None)
            .await?;

        let mut root = AggregateRoot::with_clock(aggregate_id.clone(), self.clock.clone());
        root.load_from_envelopes(events.iter().map(|e| &e.envelope), Version::initial())?;
        Ok(root)
    }

    /// Loads an aggregate, failing if it has no events.
    pub async fn load_existing(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<AggregateRoot<A>, DomainError> {
        let root = self.load(aggregate_id).await?;
        if root.version() == Version::initial() {
            return Err(DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id: aggregate_id.clone(),
            });
        }
        Ok(root)
    }

    /// Persists the uncommitted buffer and marks it committed.
    ///
    /// The store must still be at the version the buffer was recorded
    /// against. Saving an aggregate with nothing pending is a no-op.
    #[tracing::instrument(skip(self, root, metadata), fields(aggregate_id = %root.id()))]
    pub async fn save(
        &self,
        root: &mut AggregateRoot<A>,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        if !root.has_uncommitted_events() {
            return Ok(Vec::new());
        }

        let envelopes = root.uncommitted_envelopes()?;
        let stored = self
            .store
            .save_events(root.id(), envelopes, root.committed_version(), metadata)
            .await?;
        root.mark_events_as_committed();

        metrics::counter!("domain_events_committed_total", "aggregate_type" => A::aggregate_type())
            .increment(stored.len() as u64);
        tracing::debug!(version = %root.version(), count = stored.len(), "events committed");

        Ok(stored)
    }

    /// Loads the aggregate, lets `command_fn` record events on it, then saves.
    ///
    /// If `command_fn` fails nothing is saved.
    #[tracing::instrument(skip(self, metadata, command_fn), fields(aggregate_type = A::aggregate_type()))]
    pub async fn execute<F>(
        &self,
        aggregate_id: &AggregateId,
        metadata: Option<EventMetadata>,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut AggregateRoot<A>) -> Result<(), DomainError>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        command_fn(&mut aggregate)?;
        let events = self.save(&mut aggregate, metadata).await?;
        let new_version = aggregate.version();

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }
}

impl<S, A> AggregateRepository<S, A>
where
    S: EventStore,
    A: SnapshotCapable,
{
    /// Loads an aggregate from its snapshot plus the events recorded after it.
    pub async fn load_with_snapshot(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<AggregateRoot<A>, DomainError> {
        let (snapshot, events) = self.store.load_aggregate(aggregate_id).await?;

        let mut root = AggregateRoot::with_clock(aggregate_id.clone(), self.clock.clone());
        if let Some(snapshot) = snapshot {
            root.restore_from_snapshot(&snapshot)?;
        }
        let from_version = root.version();
        root.load_from_envelopes(events.iter().map(|e| &e.envelope), from_version)?;
        Ok(root)
    }

    /// Saves like [`save`](Self::save) and stores a fresh snapshot whenever the
    /// commit crosses a snapshot interval.
    pub async fn save_with_snapshot(
        &self,
        root: &mut AggregateRoot<A>,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let snapshot_due = root.should_snapshot();
        let stored = self.save(root, metadata).await?;

        if snapshot_due {
            self.store.create_snapshot(root.create_snapshot()?).await?;
            metrics::counter!("domain_snapshots_created_total", "aggregate_type" => A::aggregate_type())
                .increment(1);
            tracing::debug!(aggregate_id = %root.id(), version = %root.version(), "snapshot stored");
        }

        Ok(stored)
    }
}
