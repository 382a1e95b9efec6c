//! Shared test mocks and utilities for Strata.

pub mod acceptance;
mod clock;
mod event;
mod logging;
mod store;

pub use acceptance::run_acceptance_suite;
pub use clock::{FixedClock, TickingClock};
pub use event::{CollectingHandler, MockEvent, as_dyn, mock_events};
pub use logging::init_tracing;
pub use store::{ConflictingEventStore, FailingEventStore, RecordingEventStore};
