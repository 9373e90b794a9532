use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handler::EventHandler;
use crate::retry::RetryPolicy;

/// Dispatch priority used when a subscriber does not ask for one.
pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Options for [`EventBus::subscribe`](crate::EventBus::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    /// Lower values are dispatched first.
    pub priority: i32,

    /// Overrides the bus default retry policy for this subscription.
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            retry_policy: None,
        }
    }
}

impl SubscriptionOptions {
    /// Creates options with the default priority and the bus retry policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dispatch priority. Lower values run first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the bus's default retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }
}

#[derive(Clone)]
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub event_type: String,
    pub handler: Arc<dyn EventHandler>,
    pub priority: i32,
    pub retry_policy: RetryPolicy,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            event_type: self.event_type.clone(),
            handler_name: self.handler.name().to_string(),
            priority: self.priority,
            max_retries: self.retry_policy.max_retries,
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }
}

/// A read-only view of a registered subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub event_type: String,
    pub handler_name: String,
    pub priority: i32,
    pub max_retries: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
