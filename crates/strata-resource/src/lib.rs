//! Strata — device resource bounded context.
//!
//! Tracks the published state and latest content of every resource a device
//! exposes, plus the device's resource links, on top of the `strata-core`
//! aggregate cycle and projection engine.

pub mod application;
pub mod domain;
