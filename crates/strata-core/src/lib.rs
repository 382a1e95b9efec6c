//! Strata Core — event-sourcing primitives.
//!
//! This crate defines the event store contract, the aggregate command cycle
//! and the projection engine that replays store streams into read models.
//! It contains no storage code; backends live in their own crates.

pub mod aggregate;
pub mod cancel;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod projection;
pub mod retry;
pub mod store;

pub use aggregate::{Aggregate, AggregateError, AggregateFactory, AggregateModel};
pub use cancel::{CancelHandle, Cancellation};
pub use error::DomainError;
pub use event::{Event, EventIter, Handler, LoadedEvent, Model, VecIter};
pub use projection::Projection;
pub use retry::{DefaultRetry, RetryPolicy};
pub use store::{DeleteQuery, EventStore, SaveStatus, SnapshotQuery, VersionQuery};
