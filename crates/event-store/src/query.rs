use chrono::{DateTime, Utc};

use crate::{AggregateId, StoredEvent, Version};

/// Combined filter over every stored event.
///
/// All set criteria must match. Timestamps compare against the time the
/// event occurred, not the time it was stored.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate_id: Option<AggregateId>,

    pub aggregate_type: Option<String>,

    /// Any of these types.
    pub event_types: Option<Vec<String>>,

    pub tenant_id: Option<String>,

    /// Inclusive.
    pub from_version: Option<Version>,

    /// Inclusive.
    pub to_version: Option<Version>,

    /// Inclusive.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Inclusive.
    pub to_timestamp: Option<DateTime<Utc>>,

    pub limit: Option<usize>,

    pub offset: Option<usize>,
}

impl EventQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific aggregate.
    pub fn for_aggregate(aggregate_id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_id: Some(aggregate_id.into()),
            ..Default::default()
        }
    }

    /// Creates a query for events of a specific type.
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_types: Some(vec![event_type.into()]),
            ..Default::default()
        }
    }

    /// Creates a query for one tenant's events.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    /// Filters by aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Filters by aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filters by tenant ID.
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Filters to events starting from this version (inclusive).
    pub fn from_version(mut self, version: Version) -> Self {
        self.from_version = Some(version);
        self
    }

    /// Filters to events up to this version (inclusive).
    pub fn to_version(mut self, version: Version) -> Self {
        self.to_version = Some(version);
        self
    }

    /// Filters to events after this timestamp (inclusive).
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to events before this timestamp (inclusive).
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the event satisfies every criterion except paging.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let envelope = &event.envelope;

        if let Some(ref id) = self.aggregate_id
            && &envelope.aggregate_id != id
        {
            return false;
        }
        if let Some(ref aggregate_type) = self.aggregate_type
            && &envelope.aggregate_type != aggregate_type
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&envelope.event_type)
        {
            return false;
        }
        if let Some(ref tenant) = self.tenant_id
            && event.tenant_id() != Some(tenant.as_str())
        {
            return false;
        }
        if let Some(from) = self.from_version
            && envelope.version < from
        {
            return false;
        }
        if let Some(to) = self.to_version
            && envelope.version > to
        {
            return false;
        }
        within_range(envelope.occurred_on, self.from_timestamp, self.to_timestamp)
    }
}

/// Inclusive date-range check where either bound may be open.
pub(crate) fn within_range(
    at: DateTime<Utc>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    from.is_none_or(|from| at >= from) && to.is_none_or(|to| at <= to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventEnvelope, EventMetadata};

    fn stored(event_type: &str, version: i64, tenant: Option<&str>) -> StoredEvent {
        let envelope = EventEnvelope::builder()
            .event_type(event_type)
            .aggregate_id("u1")
            .aggregate_type("User")
            .version(Version::new(version))
            .build();
        let metadata = match tenant {
            Some(tenant) => EventMetadata::new().with_tenant(tenant),
            None => EventMetadata::new(),
        };
        StoredEvent {
            event_data: serde_json::Value::Null,
            envelope,
            metadata,
            stored_at: Utc::now(),
            stream_version: Version::new(version),
        }
    }

    #[test]
    fn query_builder_chain() {
        let query = EventQuery::new()
            .aggregate_id("u1")
            .event_type("UserCreated")
            .tenant_id("t1")
            .from_version(Version::new(1))
            .to_version(Version::new(10))
            .limit(100)
            .offset(0);

        assert_eq!(query.aggregate_id, Some(AggregateId::from("u1")));
        assert_eq!(query.event_types, Some(vec!["UserCreated".to_string()]));
        assert_eq!(query.tenant_id.as_deref(), Some("t1"));
        assert_eq!(query.to_version, Some(Version::new(10)));
        assert_eq!(query.limit, Some(100));
    }

    #[test]
    fn matches_applies_every_filter() {
        let event = stored("UserCreated", 2, Some("t1"));

        assert!(EventQuery::new().matches(&event));
        assert!(EventQuery::for_tenant("t1").matches(&event));
        assert!(!EventQuery::for_tenant("t2").matches(&event));
        assert!(!EventQuery::for_event_type("ProfileUpdated").matches(&event));
        assert!(!EventQuery::for_aggregate("u2").matches(&event));
        assert!(
            EventQuery::new()
                .from_version(Version::new(2))
                .to_version(Version::new(2))
                .matches(&event)
        );
        assert!(!EventQuery::new().from_version(Version::new(3)).matches(&event));
    }

    #[test]
    fn tenant_filter_excludes_untagged_events() {
        let event = stored("UserCreated", 1, None);
        assert!(!EventQuery::for_tenant("t1").matches(&event));
    }

    #[test]
    fn open_ranges_match_everything() {
        let now = Utc::now();
        assert!(within_range(now, None, None));
        assert!(within_range(now, Some(now), Some(now)));
        assert!(!within_range(now, Some(now + chrono::Duration::seconds(1)), None));
        assert!(!within_range(now, None, Some(now - chrono::Duration::seconds(1))));
    }
}
