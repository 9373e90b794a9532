//! Domain error types.

use common::AggregateId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// An event failed validation and was not applied.
    #[error("Invalid event for aggregate {aggregate_id}: {reason}")]
    InvalidEvent {
        aggregate_id: AggregateId,
        reason: String,
    },

    #[error("Snapshot belongs to aggregate {actual}, not {expected}")]
    SnapshotMismatch {
        expected: AggregateId,
        actual: AggregateId,
    },

    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// A business rule rejected the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true when the store refused a save because the aggregate moved on.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_concurrency_conflict())
    }
}
