//! Command handlers for the device resource context.
//!
//! Each handler builds an [`Aggregate`] for the targeted stream and runs the
//! command through it: hydrate, decide, append, compact.

use std::sync::Arc;

use strata_core::aggregate::{Aggregate, AggregateError, AggregateFactory};
use strata_core::cancel::Cancellation;
use strata_core::clock::Clock;
use strata_core::config::AggregateConfig;
use strata_core::error::DomainError;
use strata_core::store::EventStore;
use tracing::debug;

use crate::domain::aggregates::{ResourceLinks, ResourceState};
use crate::domain::commands::{ResourceLinksCommand, ResourceStateCommand};
use crate::domain::events::{ResourceEvent, links_aggregate_id, resource_aggregate_id};

/// Handles a command for one resource of a device and persists the resulting
/// events.
///
/// # Errors
///
/// Returns `AggregateError::Command` if the resource rejects the command, or
/// any other `AggregateError` raised by the command cycle.
pub async fn handle_resource_state_command(
    command: &ResourceStateCommand,
    cancel: &Cancellation,
    config: &AggregateConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventStore>,
) -> Result<Vec<ResourceEvent>, AggregateError> {
    let device_id = command.device_id().to_owned();
    let href = command.href().to_owned();
    let aggregate_id = resource_aggregate_id(&device_id, &href);
    debug!(%device_id, %href, %aggregate_id, "handling resource command");
    let factory: AggregateFactory<ResourceState> = {
        let device_id = device_id.clone();
        Arc::new(move || {
            Ok::<_, DomainError>(ResourceState::new(&device_id, &href, Arc::clone(&clock)))
        })
    };
    Aggregate::from_config(device_id, aggregate_id, config, store, factory)?
        .handle_command(cancel, command)
        .await
}

/// Handles a command for the resource links of a device and persists the
/// resulting events.
///
/// # Errors
///
/// Returns `AggregateError::Command` if the links model rejects the command,
/// or any other `AggregateError` raised by the command cycle.
pub async fn handle_resource_links_command(
    command: &ResourceLinksCommand,
    cancel: &Cancellation,
    config: &AggregateConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventStore>,
) -> Result<Vec<ResourceEvent>, AggregateError> {
    let device_id = command.device_id().to_owned();
    let factory: AggregateFactory<ResourceLinks> = {
        let device_id = device_id.clone();
        Arc::new(move || {
            Ok::<_, DomainError>(ResourceLinks::new(&device_id, Arc::clone(&clock)))
        })
    };
    let aggregate_id = links_aggregate_id(&device_id);
    Aggregate::from_config(device_id, aggregate_id, config, store, factory)?
        .handle_command(cancel, command)
        .await
}
