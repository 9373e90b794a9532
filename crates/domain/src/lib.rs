//! Domain layer of the event-sourcing core.
//!
//! - [`DomainEvent`] and [`Event`]: immutable facts recorded by aggregates
//! - [`Aggregate`] and [`AggregateRoot`]: event application, version
//!   tracking, history replay and snapshots
//! - [`AggregateRepository`]: the load, mutate, save loop against an event store

pub mod aggregate;
pub mod error;
pub mod event;
pub mod repository;

pub use aggregate::{Aggregate, AggregateRoot, SnapshotCapable};
pub use error::DomainError;
pub use event::{DomainEvent, Event};
pub use repository::{AggregateRepository, CommandResult};
