//! Test stores — mock and wrapping `EventStore` implementations for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strata_core::error::DomainError;
use strata_core::event::{Event, Handler, LoadedEvent};
use strata_core::store::{DeleteQuery, EventStore, SaveStatus, SnapshotQuery, VersionQuery};

fn connection_refused() -> DomainError {
    DomainError::Infrastructure("connection refused".into())
}

/// An event store that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventStore;

#[async_trait]
impl EventStore for FailingEventStore {
    async fn save(&self, _events: &[&dyn Event]) -> Result<SaveStatus, DomainError> {
        Err(connection_refused())
    }

    async fn load_from_snapshot(
        &self,
        _queries: &[SnapshotQuery],
        _handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn load_from_version(
        &self,
        _queries: &[VersionQuery],
        _handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn load_up_to_version(
        &self,
        _queries: &[VersionQuery],
        _handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn remove_up_to_version(&self, _queries: &[VersionQuery]) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn delete(&self, _queries: &[DeleteQuery]) -> Result<(), DomainError> {
        Err(connection_refused())
    }
}

/// Wraps a store and answers the next saves with scripted statuses before
/// delegating again.
///
/// Scripted statuses other than `Ok` are returned without touching the
/// inner store; a scripted `Ok` delegates.
pub struct ConflictingEventStore {
    inner: Arc<dyn EventStore>,
    script: Mutex<VecDeque<SaveStatus>>,
    events_only: bool,
}

impl ConflictingEventStore {
    /// Applies `script` to every save, snapshots included.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>, script: Vec<SaveStatus>) -> Self {
        Self {
            inner,
            script: Mutex::new(script.into()),
            events_only: false,
        }
    }

    /// Applies `script` only to batches that do not start with a snapshot.
    #[must_use]
    pub fn events_only(inner: Arc<dyn EventStore>, script: Vec<SaveStatus>) -> Self {
        Self {
            events_only: true,
            ..Self::new(inner, script)
        }
    }

    /// Number of scripted statuses not yet consumed.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl EventStore for ConflictingEventStore {
    async fn save(&self, events: &[&dyn Event]) -> Result<SaveStatus, DomainError> {
        let leads_with_snapshot = events.first().is_some_and(|e| e.is_snapshot());
        let scripted = if self.events_only && leads_with_snapshot {
            None
        } else {
            self.script.lock().unwrap().pop_front()
        };
        match scripted {
            Some(SaveStatus::Ok) | None => self.inner.save(events).await,
            Some(status) => Ok(status),
        }
    }

    async fn load_from_snapshot(
        &self,
        queries: &[SnapshotQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_from_snapshot(queries, handler).await
    }

    async fn load_from_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_from_version(queries, handler).await
    }

    async fn load_up_to_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_up_to_version(queries, handler).await
    }

    async fn remove_up_to_version(&self, queries: &[VersionQuery]) -> Result<(), DomainError> {
        self.inner.remove_up_to_version(queries).await
    }

    async fn delete(&self, queries: &[DeleteQuery]) -> Result<(), DomainError> {
        self.inner.delete(queries).await
    }
}

/// An event store that records every `save` call and its outcome, then
/// delegates to an inner store.
pub struct RecordingEventStore {
    inner: Arc<dyn EventStore>,
    saves: Mutex<Vec<(Vec<LoadedEvent>, SaveStatus)>>,
}

impl RecordingEventStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            saves: Mutex::new(Vec::new()),
        }
    }

    /// Every batch that reached the store with the status it got; batches
    /// that failed with an error are not recorded.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn saves(&self) -> Vec<(Vec<LoadedEvent>, SaveStatus)> {
        self.saves.lock().unwrap().clone()
    }

    /// Batches accepted with `SaveStatus::Ok`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn committed(&self) -> Vec<Vec<LoadedEvent>> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, status)| *status == SaveStatus::Ok)
            .map(|(batch, _)| batch.clone())
            .collect()
    }
}

#[async_trait]
impl EventStore for RecordingEventStore {
    async fn save(&self, events: &[&dyn Event]) -> Result<SaveStatus, DomainError> {
        let status = self.inner.save(events).await?;
        let batch = events
            .iter()
            .map(|e| LoadedEvent::from_event(*e))
            .collect::<Result<Vec<_>, _>>()?;
        self.saves.lock().unwrap().push((batch, status));
        Ok(status)
    }

    async fn load_from_snapshot(
        &self,
        queries: &[SnapshotQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_from_snapshot(queries, handler).await
    }

    async fn load_from_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_from_version(queries, handler).await
    }

    async fn load_up_to_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        self.inner.load_up_to_version(queries, handler).await
    }

    async fn remove_up_to_version(&self, queries: &[VersionQuery]) -> Result<(), DomainError> {
        self.inner.remove_up_to_version(queries).await
    }

    async fn delete(&self, queries: &[DeleteQuery]) -> Result<(), DomainError> {
        self.inner.delete(queries).await
    }
}
