//! Domain layer: aggregates, commands and events.

pub mod aggregates;
pub mod commands;
pub mod events;
