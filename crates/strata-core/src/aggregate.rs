//! Aggregate command cycle.
//!
//! [`Aggregate::handle_command`] rebuilds a fresh model from the store,
//! lets it turn a command into events and appends them under optimistic
//! concurrency. Conflicts are retried under a [`RetryPolicy`]; snapshots are
//! written when the stream since the last snapshot grows past the configured
//! threshold or when the store refuses to grow the current storage unit.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::Cancellation;
use crate::command::Command;
use crate::config::AggregateConfig;
use crate::error::DomainError;
use crate::event::{Event, EventIter, LoadedEvent, Model, VecIter};
use crate::projection::Projection;
use crate::retry::{DefaultRetry, RetryExhausted, RetryPolicy};
use crate::store::{EventStore, SaveStatus, SnapshotQuery};

/// A model able to decide commands for one aggregate.
pub trait AggregateModel: Model {
    /// Commands accepted by the model.
    type Command: Command;
    /// Events produced by the model.
    type Event: Event + Clone + 'static;

    /// Decides `command` against the current state.
    ///
    /// The first returned event must carry `new_version`, the rest follow
    /// consecutively. The result must depend only on the state, the command
    /// and `new_version`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the command is not allowed in the
    /// current state.
    fn handle_command(
        &self,
        command: &Self::Command,
        new_version: u64,
    ) -> Result<Vec<Self::Event>, DomainError>;

    /// Captures the full state as a snapshot event at `version`, if the model
    /// supports snapshots.
    fn take_snapshot(&self, version: u64) -> Option<Self::Event>;

    /// Group the hydrated aggregate belongs to; empty before any event.
    fn group_id(&self) -> &str;
}

/// Creates a blank model for each attempt of the command cycle.
pub type AggregateFactory<M> = Arc<dyn Fn() -> Result<M, DomainError> + Send + Sync>;

/// Errors surfaced by [`Aggregate`].
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The aggregate was constructed with invalid arguments.
    #[error("invalid aggregate configuration: {0}")]
    Config(String),

    /// The model factory failed.
    #[error("cannot create model: {0}")]
    Factory(#[source] DomainError),

    /// Loading the aggregate's stream failed.
    #[error("cannot load aggregate {group_id}/{aggregate_id}: {source}")]
    Hydrate {
        /// Group of the aggregate.
        group_id: String,
        /// The aggregate.
        aggregate_id: String,
        /// Underlying failure.
        #[source]
        source: DomainError,
    },

    /// The model rejected the command.
    #[error("command rejected: {0}")]
    Command(#[source] DomainError),

    /// The hydrated model belongs to a different group.
    #[error("model belongs to group {actual}, expected {expected}")]
    GroupMismatch {
        /// Group the aggregate was created for.
        expected: String,
        /// Group reported by the model.
        actual: String,
    },

    /// The store failed while writing a snapshot.
    #[error("cannot save snapshot: {0}")]
    SnapshotSave(#[source] DomainError),

    /// The store demanded a snapshot that could not be written.
    #[error("snapshot required at version {version}: {reason}")]
    CompactionFailed {
        /// Version the snapshot was due at.
        version: u64,
        /// Why compaction could not proceed.
        reason: &'static str,
    },

    /// The store failed while appending events.
    #[error("cannot save events: {0}")]
    EventSave(#[source] DomainError),

    /// Concurrency conflicts outlasted the retry policy.
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),

    /// The caller cancelled the command.
    #[error("command cancelled")]
    Cancelled,
}

impl AggregateError {
    fn at_stage(source: DomainError, stage: impl FnOnce(DomainError) -> Self) -> Self {
        match source {
            DomainError::Cancelled => Self::Cancelled,
            other => stage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    last_version: u64,
    since_snapshot: u64,
    seen: bool,
}

/// Tracks how far hydration got while the model consumes its stream.
struct CountingIter<'a, 'b> {
    inner: &'a mut (dyn EventIter + 'b),
    progress: &'a mut Progress,
}

#[async_trait]
impl<'a, 'b> EventIter for CountingIter<'a, 'b> {
    async fn next(&mut self) -> Result<Option<LoadedEvent>, DomainError> {
        let event = self.inner.next().await?;
        if let Some(event) = &event {
            self.progress.seen = true;
            self.progress.last_version = event.version();
            if event.is_snapshot() {
                self.progress.since_snapshot = 0;
            } else {
                self.progress.since_snapshot += 1;
            }
        }
        Ok(event)
    }
}

struct Hydrated<M> {
    model: M,
    progress: Progress,
}

impl<M> Hydrated<M> {
    fn new(model: M) -> Self {
        Self {
            model,
            progress: Progress::default(),
        }
    }

    fn new_version(&self) -> u64 {
        if self.progress.seen {
            self.progress.last_version + 1
        } else {
            0
        }
    }
}

#[async_trait]
impl<M: Model> Model for Hydrated<M> {
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        let Self { model, progress } = self;
        let mut counting = CountingIter {
            inner: iter,
            progress,
        };
        model.handle(&mut counting).await
    }
}

enum Attempt<E> {
    Committed(Vec<E>),
    Retry,
}

fn as_events<E: Event>(events: &[E]) -> Vec<&dyn Event> {
    events.iter().map(|e| e as &dyn Event).collect()
}

/// Runs commands against one aggregate of an [`EventStore`].
pub struct Aggregate<M: AggregateModel, R: RetryPolicy = DefaultRetry> {
    group_id: String,
    aggregate_id: String,
    snapshot_threshold: u64,
    retry: R,
    store: Arc<dyn EventStore>,
    factory: AggregateFactory<M>,
}

impl<M: AggregateModel> Aggregate<M, DefaultRetry> {
    /// Creates an aggregate with threshold and retry policy from `config`.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Config` for empty ids or a zero threshold.
    pub fn from_config(
        group_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        config: &AggregateConfig,
        store: Arc<dyn EventStore>,
        factory: AggregateFactory<M>,
    ) -> Result<Self, AggregateError> {
        config
            .validate()
            .map_err(|e| AggregateError::Config(e.to_string()))?;
        Self::new(
            group_id,
            aggregate_id,
            config.snapshot_threshold,
            config.retry_policy(),
            store,
            factory,
        )
    }
}

impl<M: AggregateModel, R: RetryPolicy> Aggregate<M, R> {
    /// Creates an aggregate.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Config` for empty ids or a zero threshold.
    pub fn new(
        group_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        snapshot_threshold: u64,
        retry: R,
        store: Arc<dyn EventStore>,
        factory: AggregateFactory<M>,
    ) -> Result<Self, AggregateError> {
        let group_id = group_id.into();
        let aggregate_id = aggregate_id.into();
        if group_id.is_empty() {
            return Err(AggregateError::Config("group id is empty".to_owned()));
        }
        if aggregate_id.is_empty() {
            return Err(AggregateError::Config("aggregate id is empty".to_owned()));
        }
        if snapshot_threshold == 0 {
            return Err(AggregateError::Config(
                "snapshot threshold must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            group_id,
            aggregate_id,
            snapshot_threshold,
            retry,
            store,
            factory,
        })
    }

    /// Group of the aggregate.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Identifier of the aggregate.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Decides `command` and persists the resulting events.
    ///
    /// Returns every event committed by this call, including snapshots
    /// written along the way, or an error with nothing else committed.
    ///
    /// # Errors
    ///
    /// See [`AggregateError`].
    #[instrument(
        skip(self, cancel, command),
        fields(
            group_id = %self.group_id,
            aggregate_id = %self.aggregate_id,
            command_type = command.command_type(),
            correlation_id = %command.correlation_id(),
        )
    )]
    pub async fn handle_command(
        &self,
        cancel: &Cancellation,
        command: &M::Command,
    ) -> Result<Vec<M::Event>, AggregateError> {
        let mut retry = self.retry.clone();
        let mut snapshots = Vec::new();
        loop {
            match self.attempt(cancel, command, &mut snapshots).await? {
                Attempt::Committed(events) => {
                    snapshots.extend(events);
                    return Ok(snapshots);
                }
                Attempt::Retry => {
                    let (wake, next) = retry.next()?;
                    warn!(attempt = next.attempt(), "retrying command after conflict");
                    cancel
                        .sleep_until(wake)
                        .await
                        .map_err(|_| AggregateError::Cancelled)?;
                    retry = next;
                }
            }
        }
    }

    async fn save(
        &self,
        cancel: &Cancellation,
        events: &[&dyn Event],
    ) -> Result<SaveStatus, DomainError> {
        cancel.run(self.store.save(events)).await?
    }

    async fn hydrate(&self, cancel: &Cancellation) -> Result<Hydrated<M>, AggregateError> {
        let factory = Arc::clone(&self.factory);
        let projection = Projection::new(Arc::clone(&self.store), move |_, _| {
            factory().map(Hydrated::new)
        });
        let query = SnapshotQuery::aggregate(self.group_id.clone(), self.aggregate_id.clone());
        cancel
            .run(projection.project(std::slice::from_ref(&query)))
            .await
            .and_then(|loaded| loaded)
            .map_err(|source| {
                AggregateError::at_stage(source, |source| AggregateError::Hydrate {
                    group_id: self.group_id.clone(),
                    aggregate_id: self.aggregate_id.clone(),
                    source,
                })
            })?;
        match projection.take(&self.group_id, &self.aggregate_id).await {
            Some(hydrated) => Ok(hydrated),
            None => (self.factory)()
                .map(Hydrated::new)
                .map_err(AggregateError::Factory),
        }
    }

    /// Writes `snapshot` on its own, for compaction.
    async fn save_snapshot(
        &self,
        cancel: &Cancellation,
        snapshot: &M::Event,
    ) -> Result<SaveStatus, AggregateError> {
        let status = self
            .save(cancel, &[snapshot as &dyn Event])
            .await
            .map_err(|e| AggregateError::at_stage(e, AggregateError::SnapshotSave))?;
        if status == SaveStatus::Ok {
            info!(version = snapshot.version(), "snapshot written");
        }
        Ok(status)
    }

    async fn attempt(
        &self,
        cancel: &Cancellation,
        command: &M::Command,
        snapshots: &mut Vec<M::Event>,
    ) -> Result<Attempt<M::Event>, AggregateError> {
        let hydrated = self.hydrate(cancel).await?;
        let mut new_version = hydrated.new_version();
        let Hydrated {
            mut model,
            progress,
        } = hydrated;
        let mut since_snapshot = progress.since_snapshot;
        let candidate = model.take_snapshot(new_version);
        let mut compacted = false;
        debug!(new_version, since_snapshot, "aggregate hydrated");

        if since_snapshot >= self.snapshot_threshold {
            if let Some(snapshot) = &candidate {
                match self.save_snapshot(cancel, snapshot).await? {
                    SaveStatus::Ok => {
                        snapshots.push(snapshot.clone());
                        new_version += 1;
                        since_snapshot = 0;
                        compacted = true;
                    }
                    SaveStatus::ConcurrencyException => return Ok(Attempt::Retry),
                    SaveStatus::SnapshotRequired => {
                        return Err(AggregateError::CompactionFailed {
                            version: new_version,
                            reason: "store rejected the snapshot itself",
                        });
                    }
                }
            }
        }

        let events = model
            .handle_command(command, new_version)
            .map_err(AggregateError::Command)?;
        let model_group = model.group_id();
        if !model_group.is_empty() && model_group != self.group_id {
            return Err(AggregateError::GroupMismatch {
                expected: self.group_id.clone(),
                actual: model_group.to_owned(),
            });
        }
        if events.is_empty() {
            return Ok(Attempt::Committed(events));
        }

        let status = self
            .save(cancel, &as_events(&events))
            .await
            .map_err(|e| AggregateError::at_stage(e, AggregateError::EventSave))?;
        match status {
            SaveStatus::Ok => {
                let mut committed = events;
                if since_snapshot + committed.len() as u64 >= self.snapshot_threshold {
                    if let Some(snapshot) = self.compact_after(cancel, &mut model, &committed).await
                    {
                        committed.push(snapshot);
                    }
                }
                Ok(Attempt::Committed(committed))
            }
            SaveStatus::ConcurrencyException => {
                warn!(version = new_version, %status, "events rejected");
                Ok(Attempt::Retry)
            }
            SaveStatus::SnapshotRequired => {
                warn!(version = new_version, %status, "events rejected");
                if compacted {
                    return Err(AggregateError::CompactionFailed {
                        version: new_version,
                        reason: "store still requires a snapshot after compaction",
                    });
                }
                let Some(snapshot) = candidate else {
                    return Err(AggregateError::CompactionFailed {
                        version: new_version,
                        reason: "model cannot take snapshots",
                    });
                };
                match self.save_snapshot(cancel, &snapshot).await? {
                    SaveStatus::Ok => {
                        snapshots.push(snapshot);
                        Ok(Attempt::Retry)
                    }
                    SaveStatus::ConcurrencyException => Err(AggregateError::CompactionFailed {
                        version: new_version,
                        reason: "concurrent write while compacting",
                    }),
                    SaveStatus::SnapshotRequired => Err(AggregateError::CompactionFailed {
                        version: new_version,
                        reason: "store rejected the snapshot itself",
                    }),
                }
            }
        }
    }

    /// Best-effort snapshot after `committed` reached the threshold.
    ///
    /// The events are already durable, so failures here are logged and the
    /// next command compacts instead.
    async fn compact_after(
        &self,
        cancel: &Cancellation,
        model: &mut M,
        committed: &[M::Event],
    ) -> Option<M::Event> {
        let last = committed.last()?.version();
        let loaded = match committed
            .iter()
            .map(|e| LoadedEvent::from_event(e))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "cannot apply committed events for snapshot");
                return None;
            }
        };
        if let Err(err) = model.handle(&mut VecIter::new(loaded)).await {
            warn!(error = %err, "cannot apply committed events for snapshot");
            return None;
        }
        let snapshot = model.take_snapshot(last + 1)?;
        match self.save_snapshot(cancel, &snapshot).await {
            Ok(SaveStatus::Ok) => Some(snapshot),
            Ok(status) => {
                warn!(version = last + 1, %status, "post-command snapshot skipped");
                None
            }
            Err(err) => {
                warn!(version = last + 1, error = %err, "post-command snapshot skipped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_source_maps_to_cancelled() {
        let err = AggregateError::at_stage(DomainError::Cancelled, AggregateError::EventSave);
        assert!(matches!(err, AggregateError::Cancelled));

        let err = AggregateError::at_stage(
            DomainError::Infrastructure("down".into()),
            AggregateError::EventSave,
        );
        assert!(matches!(err, AggregateError::EventSave(_)));
    }

    #[test]
    fn test_new_version_starts_at_zero() {
        let mut hydrated = Hydrated::new(());
        assert_eq!(hydrated.new_version(), 0);

        hydrated.progress.seen = true;
        hydrated.progress.last_version = 0;
        assert_eq!(hydrated.new_version(), 1);
    }

    #[tokio::test]
    async fn test_counting_iter_resets_on_snapshot() {
        // Arrange
        let ts = chrono::Utc::now();
        let event = |version, snapshot| {
            LoadedEvent::new(version, "t", "a1", "g1", snapshot, ts, None, serde_json::Value::Null)
        };
        let mut inner = VecIter::new(vec![event(4, true), event(5, false), event(6, false)]);
        let mut progress = Progress::default();

        // Act
        {
            let mut counting = CountingIter {
                inner: &mut inner,
                progress: &mut progress,
            };
            while counting.next().await.unwrap().is_some() {}
        }

        // Assert
        assert!(progress.seen);
        assert_eq!(progress.last_version, 6);
        assert_eq!(progress.since_snapshot, 2);
    }
}
