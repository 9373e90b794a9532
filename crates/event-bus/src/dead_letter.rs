use chrono::{DateTime, Utc};
use event_store::StoredEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subscription::SubscriptionId;

/// An event a subscriber could not process within its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub event: StoredEvent,
    pub subscription_id: SubscriptionId,
    pub handler_name: String,

    /// The error from the final attempt.
    pub error: String,

    /// Total delivery attempts, including the first.
    pub attempts: u32,

    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}
