//! Strata Event Store — storage backends for the `EventStore` trait.

pub mod memory;

pub use memory::{DEFAULT_UNIT_CAPACITY, InMemoryEventStore};
