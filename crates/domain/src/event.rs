//! The domain event record shared by every aggregate.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::{EventEnvelope, EventId, Version};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Payload of a domain event.
///
/// Implemented by a per-aggregate enum whose variants are the facts that
/// aggregate can record. Aggregates dispatch on the variant with an
/// exhaustive `match`.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Send + Sync + Clone + std::fmt::Debug + 'static
{
    /// Returns the event type name, by convention the variant's name.
    fn event_type(&self) -> &'static str;
}

/// An immutable fact recorded by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<E> {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub occurred_on: DateTime<Utc>,
    /// The aggregate's version after this event is applied.
    pub event_version: Version,
    pub payload: E,
}

impl<E: DomainEvent> Event<E> {
    /// Creates an event stamped with the current time.
    pub fn new(aggregate_id: impl Into<AggregateId>, event_version: Version, payload: E) -> Self {
        Self::at(aggregate_id, event_version, Utc::now(), payload)
    }

    /// Creates an event with an explicit timestamp.
    pub fn at(
        aggregate_id: impl Into<AggregateId>,
        event_version: Version,
        occurred_on: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_id: aggregate_id.into(),
            occurred_on,
            event_version,
            payload,
        }
    }

    /// Returns the payload's event type.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Base fields plus the payload as a JSON mapping.
    pub fn to_json(&self) -> Result<serde_json::Value, DomainError> {
        Ok(serde_json::json!({
            "event_id": self.event_id,
            "aggregate_id": self.aggregate_id,
            "event_type": self.event_type(),
            "event_version": self.event_version,
            "occurred_on": self.occurred_on,
            "payload": serde_json::to_value(&self.payload)?,
        }))
    }

    /// Serializes the event for the store.
    pub fn to_envelope(&self, aggregate_type: &str) -> Result<EventEnvelope, DomainError> {
        Ok(EventEnvelope::builder()
            .event_id(self.event_id)
            .event_type(self.event_type())
            .aggregate_id(self.aggregate_id.clone())
            .aggregate_type(aggregate_type)
            .version(self.event_version)
            .occurred_on(self.occurred_on)
            .payload(&self.payload)?
            .build())
    }

    /// Rebuilds an event from its stored form.
    ///
    /// Fails if the payload does not decode to `E` or decodes to a variant
    /// whose type differs from the recorded `event_type`.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, DomainError> {
        let payload = E::deserialize(&envelope.payload)?;
        if payload.event_type() != envelope.event_type {
            return Err(DomainError::InvalidEvent {
                aggregate_id: envelope.aggregate_id.clone(),
                reason: format!(
                    "stored type {} does not match payload type {}",
                    envelope.event_type,
                    payload.event_type()
                ),
            });
        }

        Ok(Self {
            event_id: envelope.event_id,
            aggregate_id: envelope.aggregate_id.clone(),
            occurred_on: envelope.occurred_on,
            event_version: envelope.version,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum SessionEvent {
        Opened { device: String },
        Closed,
    }

    impl DomainEvent for SessionEvent {
        fn event_type(&self) -> &'static str {
            match self {
                SessionEvent::Opened { .. } => "Opened",
                SessionEvent::Closed => "Closed",
            }
        }
    }

    #[test]
    fn new_event_gets_fresh_identity() {
        let a = Event::new("s1", Version::first(), SessionEvent::Closed);
        let b = Event::new("s1", Version::first(), SessionEvent::Closed);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_type(), "Closed");
    }

    #[test]
    fn to_json_includes_base_fields() {
        let event = Event::new(
            "s1",
            Version::new(3),
            SessionEvent::Opened {
                device: "phone".to_string(),
            },
        );
        let json = event.to_json().unwrap();

        assert_eq!(json["aggregate_id"], "s1");
        assert_eq!(json["event_type"], "Opened");
        assert_eq!(json["event_version"], 3);
        assert_eq!(json["payload"]["data"]["device"], "phone");
    }

    #[test]
    fn envelope_round_trip_preserves_event() {
        let event = Event::new(
            "s1",
            Version::new(2),
            SessionEvent::Opened {
                device: "laptop".to_string(),
            },
        );

        let envelope = event.to_envelope("Session").unwrap();
        assert_eq!(envelope.aggregate_type, "Session");
        assert_eq!(envelope.event_type, "Opened");

        let restored = Event::<SessionEvent>::from_envelope(&envelope).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn from_envelope_rejects_mismatched_type() {
        let mut envelope = Event::new("s1", Version::first(), SessionEvent::Closed)
            .to_envelope("Session")
            .unwrap();
        envelope.event_type = "Opened".to_string();

        let result = Event::<SessionEvent>::from_envelope(&envelope);
        assert!(matches!(result, Err(DomainError::InvalidEvent { .. })));
    }
}
