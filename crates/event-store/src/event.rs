use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError};

/// Unique identifier for a domain event, assigned when the event is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The all-zero id never identifies a real event.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Position of an event within its aggregate's stream.
///
/// An aggregate with no events is at version 0. The first event carries
/// version 1 and each later event increments by exactly one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of an aggregate that has no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version carried by the first event of a stream.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the version after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the version `count` events after this one.
    pub fn advanced_by(&self, count: usize) -> Self {
        Self(self.0 + count as i64)
    }

    /// Returns the version `count` events before this one, never below zero.
    pub fn rewound_by(&self, count: usize) -> Self {
        Self((self.0 - count as i64).max(0))
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A domain event in its serialized form.
///
/// This is the shape events take when they cross the storage and dispatch
/// boundary. The payload is whatever mapping the concrete event produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,

    /// Discriminator, by convention the concrete event's name (e.g. "UserCreated").
    pub event_type: String,

    pub aggregate_id: AggregateId,

    /// The kind of aggregate that raised the event (e.g. "User", "Tenant").
    pub aggregate_type: String,

    /// The aggregate's version after this event is applied.
    pub version: Version,

    pub occurred_on: DateTime<Utc>,

    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Creates a new envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Checks the structural invariants every stored event must satisfy.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if self.event_id.is_nil() {
            return Err(EventStoreError::validation("event id is required"));
        }
        if self.aggregate_id.is_empty() {
            return Err(EventStoreError::validation("aggregate id is required"));
        }
        if self.event_type.trim().is_empty() {
            return Err(EventStoreError::validation(format!(
                "event type is required for event {}",
                self.event_id
            )));
        }
        if self.version < Version::first() {
            return Err(EventStoreError::validation(format!(
                "event version must be at least 1, got {}",
                self.version
            )));
        }
        Ok(())
    }

    /// Produces the mapping persisted as `event_data`: base fields plus payload.
    pub fn to_json(&self) -> Result<serde_json::Value, EventStoreError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    occurred_on: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the aggregate version after this event.
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets when the event happened. If not set, the current time will be used.
    pub fn occurred_on(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = Some(occurred_on);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from an already serialized value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if event_type, aggregate_id, aggregate_type or version is not set.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.expect("event_type is required"),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            aggregate_type: self.aggregate_type.expect("aggregate_type is required"),
            version: self.version.expect("version is required"),
            occurred_on: self.occurred_on.unwrap_or_else(Utc::now),
            payload: self.payload.unwrap_or(serde_json::Value::Null),
        }
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            version: self.version?,
            occurred_on: self.occurred_on.unwrap_or_else(Utc::now),
            payload: self.payload.unwrap_or(serde_json::Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(version: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type("UserCreated")
            .aggregate_id("u1")
            .aggregate_type("User")
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"email": "a@example.com"}))
            .build()
    }

    #[test]
    fn version_arithmetic() {
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::new(2).advanced_by(3), Version::new(5));
        assert_eq!(Version::new(5).rewound_by(2), Version::new(3));
        assert_eq!(Version::new(1).rewound_by(4), Version::initial());
    }

    #[test]
    fn builder_fills_defaults() {
        let built = envelope(1);

        assert!(!built.event_id.is_nil());
        assert_eq!(built.event_type, "UserCreated");
        assert_eq!(built.aggregate_id, AggregateId::from("u1"));
        assert_eq!(built.version, Version::first());
        assert!(built.occurred_on <= Utc::now());
    }

    #[test]
    fn try_build_returns_none_on_missing_fields() {
        assert!(EventEnvelope::builder().try_build().is_none());
        assert!(
            EventEnvelope::builder()
                .event_type("UserCreated")
                .aggregate_id("u1")
                .try_build()
                .is_none()
        );
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        assert!(envelope(1).validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_version() {
        let err = envelope(0).validate().unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)));
    }

    #[test]
    fn validate_rejects_blank_identity() {
        let mut event = envelope(1);
        event.aggregate_id = AggregateId::from("");
        assert!(event.validate().is_err());

        let mut event = envelope(1);
        event.event_type = " ".to_string();
        assert!(event.validate().is_err());

        let mut event = envelope(1);
        event.event_id = EventId::from_uuid(Uuid::nil());
        assert!(event.validate().is_err());
    }

    #[test]
    fn to_json_carries_base_fields_and_payload() {
        let event = envelope(1);
        let json = event.to_json().unwrap();

        assert_eq!(json["event_type"], "UserCreated");
        assert_eq!(json["aggregate_id"], "u1");
        assert_eq!(json["version"], 1);
        assert_eq!(json["payload"]["email"], "a@example.com");
        assert_eq!(json["event_id"], event.event_id.to_string());
    }
}
