//! Event-sourced aggregate root.

use common::{AggregateId, SharedClock, system_clock};
use event_store::{EventEnvelope, Snapshot, Version};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::DomainError;
use crate::event::{DomainEvent, Event};

/// State of an event-sourced aggregate.
///
/// Implementations hold only business fields. Identity, version and the
/// uncommitted buffer live in [`AggregateRoot`].
pub trait Aggregate: Default + Send + Sync {
    /// The closed set of events this aggregate records and replays.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Mutates state for one event.
    ///
    /// Must only assign fields: the same call happens when an event is first
    /// recorded and every time it is replayed from history.
    fn handle_event(&mut self, event: &Event<Self::Event>, is_from_history: bool);
}

/// Aggregates whose state can be serialized to bound replay cost.
pub trait SnapshotCapable: Aggregate + Serialize + DeserializeOwned {
    /// Number of events between snapshots.
    fn snapshot_interval() -> usize {
        100
    }

    /// Serializes the state for a snapshot.
    fn to_snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuilds the state from snapshot data.
    fn from_snapshot(data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(data)
    }
}

/// Identity, version and pending events wrapped around aggregate state.
///
/// `version` counts the events behind the current state: new events advance
/// it one at a time and [`load_from_history`](Self::load_from_history) sets
/// it from the replayed batch. Only new events enter the uncommitted buffer.
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    version: Version,
    uncommitted: Vec<Event<A::Event>>,
    state: A,
    clock: SharedClock,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates an empty aggregate at version 0.
    pub fn new(id: impl Into<AggregateId>) -> Self {
        Self::with_clock(id, system_clock())
    }

    /// Creates an empty aggregate that timestamps recorded events from `clock`.
    pub fn with_clock(id: impl Into<AggregateId>, clock: SharedClock) -> Self {
        Self {
            id: id.into(),
            version: Version::initial(),
            uncommitted: Vec::new(),
            state: A::default(),
            clock,
        }
    }

    /// Returns the aggregate ID.
    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Returns the version including uncommitted events.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the aggregate state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// The stored version the uncommitted buffer was recorded against.
    pub fn committed_version(&self) -> Version {
        self.version.rewound_by(self.uncommitted.len())
    }

    /// Records a new fact: stamps it with the next version and applies it.
    pub fn record(&mut self, payload: A::Event) -> Result<(), DomainError> {
        let event = Event::at(
            self.id.clone(),
            self.version.next(),
            self.clock.now(),
            payload,
        );
        self.apply(event, false)
    }

    /// Applies an event to the aggregate.
    ///
    /// The event is validated before any state changes. Events not from
    /// history are buffered as uncommitted and advance the version, and must
    /// not be dated after the clock's now.
    pub fn apply(&mut self, event: Event<A::Event>, is_from_history: bool) -> Result<(), DomainError> {
        self.validate(&event, is_from_history)?;
        self.state.handle_event(&event, is_from_history);
        if !is_from_history {
            self.version = self.version.next();
            self.uncommitted.push(event);
        }
        Ok(())
    }

    /// Rebuilds state from stored history.
    ///
    /// Events are sorted by version before they are applied, and the whole
    /// batch is validated first. Afterwards `version == from_version + events.len()`.
    pub fn load_from_history(
        &mut self,
        mut events: Vec<Event<A::Event>>,
        from_version: Version,
    ) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }

        events.sort_by_key(|e| e.event_version);
        for event in &events {
            self.validate(event, true)?;
        }

        let count = events.len();
        for event in &events {
            self.state.handle_event(event, true);
        }
        self.version = from_version.advanced_by(count);
        Ok(())
    }

    /// Decodes stored envelopes and replays them.
    pub fn load_from_envelopes<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
        from_version: Version,
    ) -> Result<(), DomainError> {
        let events = envelopes
            .into_iter()
            .map(Event::from_envelope)
            .collect::<Result<Vec<_>, _>>()?;
        self.load_from_history(events, from_version)
    }

    /// Events recorded since the last commit, oldest first.
    pub fn uncommitted_events(&self) -> &[Event<A::Event>] {
        &self.uncommitted
    }

    /// Moves the uncommitted events out, leaving the buffer empty.
    pub fn take_uncommitted_events(&mut self) -> Vec<Event<A::Event>> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Serializes the uncommitted buffer for the store.
    pub fn uncommitted_envelopes(&self) -> Result<Vec<EventEnvelope>, DomainError> {
        self.uncommitted
            .iter()
            .map(|e| e.to_envelope(A::aggregate_type()))
            .collect()
    }

    /// Clears the buffer once its events are durably stored. Version is unchanged.
    pub fn mark_events_as_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Returns whether events are waiting to be committed.
    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Returns the number of events waiting to be committed.
    pub fn uncommitted_events_count(&self) -> usize {
        self.uncommitted.len()
    }

    fn validate(&self, event: &Event<A::Event>, is_from_history: bool) -> Result<(), DomainError> {
        let reason = if event.aggregate_id.is_empty() {
            Some("aggregate id is required".to_string())
        } else if event.aggregate_id != self.id {
            Some(format!("event belongs to aggregate {}", event.aggregate_id))
        } else if event.event_id.is_nil() {
            Some("event id is required".to_string())
        } else if event.event_type().trim().is_empty() {
            Some("event type is required".to_string())
        } else if event.event_version < Version::first() {
            Some(format!(
                "event version must be at least 1, got {}",
                event.event_version
            ))
        } else if !is_from_history && event.occurred_on > self.clock.now() {
            Some(format!("event occurred in the future at {}", event.occurred_on))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DomainError::InvalidEvent {
                aggregate_id: self.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl<A: SnapshotCapable> AggregateRoot<A> {
    /// Captures the current state and version.
    pub fn create_snapshot(&self) -> Result<Snapshot, DomainError> {
        Ok(Snapshot::new(
            self.id.clone(),
            A::aggregate_type(),
            self.version,
            self.state.to_snapshot()?,
        )
        .created_at(self.clock.now()))
    }

    /// Replaces state and version with the snapshot's.
    pub fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DomainError> {
        if snapshot.aggregate_id != self.id {
            return Err(DomainError::SnapshotMismatch {
                expected: self.id.clone(),
                actual: snapshot.aggregate_id.clone(),
            });
        }

        self.state = A::from_snapshot(&snapshot.data)?;
        self.version = snapshot.version;
        self.uncommitted.clear();
        Ok(())
    }

    /// Returns whether committing the buffer crosses a snapshot interval boundary.
    pub fn should_snapshot(&self) -> bool {
        let interval = A::snapshot_interval() as i64;
        interval > 0
            && self.committed_version().as_i64() / interval < self.version.as_i64() / interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Clock, ManualClock};
    use event_store::EventId;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum CounterEvent {
        Incremented { by: i64 },
        Reset,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Incremented { .. } => "Incremented",
                CounterEvent::Reset => "Reset",
            }
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        total: i64,
        resets: u32,
        replayed: u32,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn handle_event(&mut self, event: &Event<CounterEvent>, is_from_history: bool) {
            match &event.payload {
                CounterEvent::Incremented { by } => self.total += by,
                CounterEvent::Reset => {
                    self.total = 0;
                    self.resets += 1;
                }
            }
            if is_from_history {
                self.replayed += 1;
            }
        }
    }

    impl SnapshotCapable for Counter {
        fn snapshot_interval() -> usize {
            3
        }
    }

    fn incremented(id: &str, version: i64, by: i64) -> Event<CounterEvent> {
        Event::new(id, Version::new(version), CounterEvent::Incremented { by })
    }

    #[test]
    fn record_advances_version_and_buffers() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.record(CounterEvent::Incremented { by: 2 }).unwrap();
        root.record(CounterEvent::Incremented { by: 3 }).unwrap();

        assert_eq!(root.version(), Version::new(2));
        assert_eq!(root.state().total, 5);
        assert_eq!(root.uncommitted_events_count(), 2);
        let versions: Vec<i64> = root
            .uncommitted_events()
            .iter()
            .map(|e| e.event_version.as_i64())
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn apply_rejects_foreign_event_without_mutating() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        let result = root.apply(incremented("c2", 1, 10), false);

        assert!(matches!(result, Err(DomainError::InvalidEvent { .. })));
        assert_eq!(root.state().total, 0);
        assert_eq!(root.version(), Version::initial());
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn apply_rejects_malformed_events() {
        let mut root = AggregateRoot::<Counter>::new("c1");

        let mut nil_id = incremented("c1", 1, 1);
        nil_id.event_id = EventId::from_uuid(Uuid::nil());
        assert!(root.apply(nil_id, false).is_err());

        assert!(root.apply(incremented("c1", 0, 1), false).is_err());

        let future = Event::at(
            "c1",
            Version::first(),
            chrono::Utc::now() + chrono::Duration::hours(1),
            CounterEvent::Reset,
        );
        assert!(root.apply(future, false).is_err());

        assert_eq!(root.state(), &Counter::default());
    }

    #[test]
    fn history_does_not_touch_buffer() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.apply(incremented("c1", 1, 4), true).unwrap();

        assert_eq!(root.state().total, 4);
        assert_eq!(root.version(), Version::initial());
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn load_from_history_sorts_and_sets_version() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        let events = vec![
            Event::new("c1", Version::new(3), CounterEvent::Incremented { by: 7 }),
            Event::new("c1", Version::new(1), CounterEvent::Incremented { by: 1 }),
            Event::new("c1", Version::new(2), CounterEvent::Reset),
        ];

        root.load_from_history(events, Version::initial()).unwrap();

        // 1, reset, then 7
        assert_eq!(root.state().total, 7);
        assert_eq!(root.state().replayed, 3);
        assert_eq!(root.version(), Version::new(3));
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn history_from_a_clock_ahead_still_loads() {
        let clock = ManualClock::default();
        let mut root = AggregateRoot::<Counter>::with_clock("c1", clock.shared());
        let ahead = clock.now() + chrono::Duration::minutes(5);
        let events = vec![
            Event::at("c1", Version::new(1), ahead, CounterEvent::Incremented { by: 2 }),
            Event::at("c1", Version::new(2), ahead, CounterEvent::Incremented { by: 3 }),
        ];

        root.load_from_history(events, Version::initial()).unwrap();
        assert_eq!(root.state().total, 5);
        assert_eq!(root.version(), Version::new(2));

        let live = Event::at("c1", Version::new(3), ahead, CounterEvent::Reset);
        assert!(matches!(
            root.apply(live, false),
            Err(DomainError::InvalidEvent { .. })
        ));
        assert_eq!(root.version(), Version::new(2));
    }

    #[test]
    fn load_from_history_empty_is_noop() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.load_from_history(Vec::new(), Version::new(9)).unwrap();
        assert_eq!(root.version(), Version::initial());
    }

    #[test]
    fn load_from_history_is_all_or_nothing() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        let events = vec![incremented("c1", 1, 5), incremented("other", 2, 5)];

        assert!(root.load_from_history(events, Version::initial()).is_err());
        assert_eq!(root.state().total, 0);
        assert_eq!(root.version(), Version::initial());
    }

    #[test]
    fn mark_committed_keeps_version() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.record(CounterEvent::Incremented { by: 1 }).unwrap();
        assert_eq!(root.committed_version(), Version::initial());

        root.mark_events_as_committed();

        assert_eq!(root.uncommitted_events_count(), 0);
        assert_eq!(root.version(), Version::first());
        assert_eq!(root.committed_version(), Version::first());
    }

    #[test]
    fn take_uncommitted_events_drains_buffer() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.record(CounterEvent::Reset).unwrap();

        let taken = root.take_uncommitted_events();

        assert_eq!(taken.len(), 1);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn uncommitted_envelopes_carry_aggregate_type() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.record(CounterEvent::Incremented { by: 1 }).unwrap();

        let envelopes = root.uncommitted_envelopes().unwrap();
        assert_eq!(envelopes[0].aggregate_type, "Counter");
        assert_eq!(envelopes[0].event_type, "Incremented");
        assert_eq!(envelopes[0].version, Version::first());
    }

    #[test]
    fn recorded_events_use_injected_clock() {
        let clock = ManualClock::default();
        let mut root = AggregateRoot::<Counter>::with_clock("c1", clock.shared());

        root.record(CounterEvent::Reset).unwrap();

        assert_eq!(root.uncommitted_events()[0].occurred_on, clock.now());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut source = AggregateRoot::<Counter>::new("c1");
        source.record(CounterEvent::Incremented { by: 5 }).unwrap();
        source.record(CounterEvent::Reset).unwrap();
        source.record(CounterEvent::Incremented { by: 2 }).unwrap();

        let snapshot = source.create_snapshot().unwrap();
        let mut restored = AggregateRoot::<Counter>::new("c1");
        restored.restore_from_snapshot(&snapshot).unwrap();

        assert_eq!(restored.state(), source.state());
        assert_eq!(restored.version(), source.version());
        assert!(!restored.has_uncommitted_events());
    }

    #[test]
    fn restore_rejects_foreign_snapshot() {
        let source = AggregateRoot::<Counter>::new("c1");
        let snapshot = source.create_snapshot().unwrap();

        let mut other = AggregateRoot::<Counter>::new("c2");
        let result = other.restore_from_snapshot(&snapshot);

        assert!(matches!(result, Err(DomainError::SnapshotMismatch { .. })));
    }

    #[test]
    fn should_snapshot_when_crossing_interval() {
        let mut root = AggregateRoot::<Counter>::new("c1");
        root.record(CounterEvent::Reset).unwrap();
        root.record(CounterEvent::Reset).unwrap();
        assert!(!root.should_snapshot());

        root.record(CounterEvent::Reset).unwrap();
        assert!(root.should_snapshot());

        root.mark_events_as_committed();
        assert!(!root.should_snapshot());

        root.record(CounterEvent::Reset).unwrap();
        assert!(!root.should_snapshot());
    }
}
