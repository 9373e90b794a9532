//! Persistence records wrapping serialized domain events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventEnvelope, Version};

/// Context attached to a batch of events when it is saved.
///
/// The store indexes `tenant_id` and otherwise passes these values through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// The component that produced the events (e.g. "auth-service").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl EventMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tenant ID.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the acting user ID.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the originating service or component.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the correlation ID.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the causation ID.
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Adds a free-form entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// An event as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub envelope: EventEnvelope,

    /// The envelope's JSON mapping, persisted verbatim.
    pub event_data: serde_json::Value,

    pub metadata: EventMetadata,

    pub stored_at: DateTime<Utc>,

    /// Position within the aggregate's stream. Gapless and strictly
    /// increasing per aggregate.
    pub stream_version: Version,
}

impl StoredEvent {
    /// The store-assigned identity, `{aggregate_id}-{stream_version}`.
    pub fn id(&self) -> String {
        stored_event_id(&self.envelope.aggregate_id, self.stream_version)
    }

    /// Returns the aggregate ID.
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.envelope.aggregate_id
    }

    /// Returns the event type.
    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }

    /// Returns the event version.
    pub fn version(&self) -> Version {
        self.envelope.version
    }

    /// Returns when the event occurred.
    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.envelope.occurred_on
    }

    /// Returns the tenant ID, if set.
    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.tenant_id.as_deref()
    }
}

/// Formats the identity used for point lookups.
pub fn stored_event_id(aggregate_id: &AggregateId, stream_version: Version) -> String {
    format!("{aggregate_id}-{stream_version}")
}
