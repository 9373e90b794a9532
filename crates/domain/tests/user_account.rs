//! Integration tests driving a small user-account aggregate through the
//! aggregate root and the in-memory event store.

use common::AggregateId;
use domain::{
    Aggregate, AggregateRepository, AggregateRoot, DomainError, DomainEvent, Event,
    SnapshotCapable,
};
use event_store::{EventStore, EventStoreError, InMemoryEventStore, Version};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum UserEvent {
    UserCreated { email: String, display_name: String },
    ProfileUpdated { display_name: String },
    Deactivated,
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::UserCreated { .. } => "UserCreated",
            UserEvent::ProfileUpdated { .. } => "ProfileUpdated",
            UserEvent::Deactivated => "Deactivated",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct UserAccount {
    email: Option<String>,
    display_name: String,
    profile_updates: u32,
    active: bool,
}

impl Aggregate for UserAccount {
    type Event = UserEvent;

    fn aggregate_type() -> &'static str {
        "User"
    }

    fn handle_event(&mut self, event: &Event<UserEvent>, _is_from_history: bool) {
        match &event.payload {
            UserEvent::UserCreated {
                email,
                display_name,
            } => {
                self.email = Some(email.clone());
                self.display_name = display_name.clone();
                self.active = true;
            }
            UserEvent::ProfileUpdated { display_name } => {
                self.display_name = display_name.clone();
                self.profile_updates += 1;
            }
            UserEvent::Deactivated => self.active = false,
        }
    }
}

impl SnapshotCapable for UserAccount {}

fn created(name: &str) -> UserEvent {
    UserEvent::UserCreated {
        email: format!("{name}@example.com"),
        display_name: name.to_string(),
    }
}

fn renamed(name: &str) -> UserEvent {
    UserEvent::ProfileUpdated {
        display_name: name.to_string(),
    }
}

fn scripted_history() -> Vec<UserEvent> {
    vec![
        created("ada"),
        renamed("Ada L."),
        renamed("Ada Lovelace"),
        UserEvent::Deactivated,
    ]
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn create_update_and_conflict() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::from("u1");
        let mut user = AggregateRoot::<UserAccount>::new("u1");
        assert_eq!(user.version(), Version::initial());

        user.record(created("ada")).unwrap();
        assert_eq!(user.version(), Version::first());
        assert_eq!(user.uncommitted_events_count(), 1);

        let first_batch = user.uncommitted_envelopes().unwrap();
        store
            .save_events(&id, first_batch, Version::initial(), None)
            .await
            .unwrap();
        assert_eq!(store.get_aggregate_version(&id).await.unwrap(), Version::first());

        user.mark_events_as_committed();
        assert_eq!(user.uncommitted_events_count(), 0);

        user.record(renamed("Ada L.")).unwrap();
        assert_eq!(user.version(), Version::new(2));

        let second_batch = user.uncommitted_envelopes().unwrap();
        store
            .save_events(&id, second_batch.clone(), Version::first(), None)
            .await
            .unwrap();

        let err = store
            .save_events(&id, second_batch, Version::first(), None)
            .await
            .unwrap_err();
        match err {
            EventStoreError::ConcurrencyConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Version::new(1));
                assert_eq!(actual, Version::new(2));
            }
            other => panic!("expected concurrency conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repository_round_trip_preserves_events() {
        let repo = AggregateRepository::<_, UserAccount>::new(InMemoryEventStore::new());
        let id = AggregateId::from("u1");

        let result = repo
            .execute(&id, None, |user| {
                for event in scripted_history() {
                    user.record(event)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        let recorded: Vec<_> = result.events.iter().map(|e| e.envelope.clone()).collect();

        let stored = repo
            .store()
            .get_events(&id, Version::initial(), None)
            .await
            .unwrap();

        assert_eq!(stored.len(), 4);
        for (stored, original) in stored.iter().zip(&recorded) {
            assert_eq!(stored.event_type(), original.event_type);
            assert_eq!(stored.version(), original.version);
            assert_eq!(stored.envelope.payload, original.payload);
        }
        let payloads: Vec<UserEvent> = stored
            .iter()
            .map(|e| Event::<UserEvent>::from_envelope(&e.envelope).unwrap().payload)
            .collect();
        assert_eq!(payloads, scripted_history());
    }

    #[tokio::test]
    async fn deactivated_user_rejects_updates() {
        let repo = AggregateRepository::<_, UserAccount>::new(InMemoryEventStore::new());
        let id = AggregateId::from("u1");
        repo.execute(&id, None, |user| {
            user.record(created("bob"))?;
            user.record(UserEvent::Deactivated)
        })
        .await
        .unwrap();

        let result = repo
            .execute(&id, None, |user| {
                if !user.state().active {
                    return Err(DomainError::Rejected("user is deactivated".to_string()));
                }
                user.record(renamed("Robert"))
            })
            .await;

        assert!(matches!(result, Err(DomainError::Rejected(_))));
        assert_eq!(
            repo.store().get_aggregate_version(&id).await.unwrap(),
            Version::new(2)
        );
    }
}

mod properties {
    use super::*;

    #[test]
    fn version_tracks_each_recorded_event() {
        let mut user = AggregateRoot::<UserAccount>::new("u1");

        for (index, event) in scripted_history().into_iter().enumerate() {
            user.record(event).unwrap();
            assert_eq!(user.version().as_i64(), index as i64 + 1);
        }

        for (position, event) in user.uncommitted_events().iter().enumerate() {
            assert_eq!(event.event_version.as_i64(), position as i64 + 1);
        }
    }

    #[test]
    fn replay_converges_with_live_application() {
        let mut live = AggregateRoot::<UserAccount>::new("u1");
        for event in scripted_history() {
            live.record(event).unwrap();
        }
        let history: Vec<_> = live.uncommitted_events().to_vec();
        live.mark_events_as_committed();

        let mut replayed = AggregateRoot::<UserAccount>::new("u1");
        replayed
            .load_from_history(history, Version::initial())
            .unwrap();

        assert_eq!(replayed.state(), live.state());
        assert_eq!(replayed.version(), live.version());
    }

    #[test]
    fn uncommitted_count_matches_live_applies_since_commit() {
        let mut user = AggregateRoot::<UserAccount>::new("u1");
        user.record(created("ada")).unwrap();
        user.record(renamed("A")).unwrap();
        assert_eq!(user.uncommitted_events_count(), 2);

        user.mark_events_as_committed();
        let version = user.version();
        assert_eq!(user.uncommitted_events_count(), 0);
        assert_eq!(user.version(), version);

        user.apply(Event::new("u1", Version::new(3), renamed("B")), true)
            .unwrap();
        assert_eq!(user.uncommitted_events_count(), 0);

        user.record(renamed("C")).unwrap();
        assert_eq!(user.uncommitted_events_count(), 1);
    }

    #[test]
    fn snapshot_restore_reproduces_state() {
        let mut source = AggregateRoot::<UserAccount>::new("u1");
        for event in scripted_history() {
            source.record(event).unwrap();
        }

        let snapshot = source.create_snapshot().unwrap();
        let mut restored = AggregateRoot::<UserAccount>::new("u1");
        restored.restore_from_snapshot(&snapshot).unwrap();

        assert_eq!(restored.state(), source.state());
        assert_eq!(restored.version(), Version::new(4));
    }

    #[tokio::test]
    async fn second_save_at_same_version_reports_new_stored_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::from("u1");

        let mut writer = AggregateRoot::<UserAccount>::new("u1");
        writer.record(created("ada")).unwrap();
        writer.record(renamed("Ada")).unwrap();
        let batch = writer.uncommitted_envelopes().unwrap();

        store
            .save_events(&id, batch.clone(), Version::initial(), None)
            .await
            .unwrap();
        let err = store
            .save_events(&id, batch, Version::initial(), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { expected, actual, .. }
                if expected == Version::initial() && actual == Version::new(2)
        ));
    }
}
