//! Multiplexed replay of store streams into per-aggregate models.
//!
//! A store hands a [`Projection`] one stream that may interleave many
//! aggregates. The projection splits it into per-aggregate runs, feeds each
//! run to the model registered for that aggregate and keeps, per model, the
//! last applied version so replays are idempotent. A run that skips versions
//! is cut short and reported as a reload query anchored at the last applied
//! version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::DomainError;
use crate::event::{EventIter, Handler, LoadedEvent, Model};
use crate::store::{EventStore, SnapshotQuery, VersionQuery};

type ModelFactory<M> = Box<dyn Fn(&str, &str) -> Result<M, DomainError> + Send + Sync>;

/// What to do with an incoming event, given what a model already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Accept,
    Ignore,
    Reload,
}

/// Replay position of one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct VersionState {
    version: u64,
    has_snapshot: bool,
}

impl VersionState {
    /// Classifies `event` and advances the state when it is accepted.
    ///
    /// `has_snapshot` means "a valid starting point was applied": either a
    /// snapshot or version 0. Once set, a repeated version 0 is ignored
    /// rather than re-applied.
    pub(crate) fn update(&mut self, event: &LoadedEvent) -> Decision {
        let version = event.version();
        let starts_stream = version == 0 && !self.has_snapshot;
        let newer_snapshot = event.is_snapshot() && (!self.has_snapshot || version > self.version);
        if starts_stream || newer_snapshot {
            self.version = version;
            self.has_snapshot = true;
            return Decision::Accept;
        }
        if self.has_snapshot && self.version.checked_add(1) == Some(version) {
            self.version = version;
            return Decision::Accept;
        }
        if self.has_snapshot && version <= self.version {
            return Decision::Ignore;
        }
        Decision::Reload
    }
}

struct Slot<M> {
    model: M,
    state: VersionState,
}

enum Rewind {
    Snapshot(LoadedEvent),
    Other(LoadedEvent),
    End,
}

/// Presents the run of one aggregate to its model.
///
/// Ends at the first event of another aggregate, which is kept for the
/// caller, or at a version gap, which records a reload query.
struct ReplayIter<'a, 'b> {
    inner: &'a mut (dyn EventIter + 'b),
    state: &'a mut VersionState,
    group_id: String,
    aggregate_id: String,
    first: Option<LoadedEvent>,
    next_to_process: Option<LoadedEvent>,
    reload: Option<VersionQuery>,
    done: bool,
}

impl<'a, 'b> ReplayIter<'a, 'b> {
    fn new(
        inner: &'a mut (dyn EventIter + 'b),
        state: &'a mut VersionState,
        first: LoadedEvent,
    ) -> Self {
        Self {
            inner,
            state,
            group_id: first.group_id().to_owned(),
            aggregate_id: first.aggregate_id().to_owned(),
            first: Some(first),
            next_to_process: None,
            reload: None,
            done: false,
        }
    }

    fn owns(&self, event: &LoadedEvent) -> bool {
        event.group_id() == self.group_id && event.aggregate_id() == self.aggregate_id
    }

    /// Skips ahead to the next snapshot of this aggregate, stopping early at
    /// another aggregate's event or the end of the stream.
    async fn rewind_to_snapshot(&mut self) -> Result<Rewind, DomainError> {
        loop {
            match self.inner.next().await? {
                None => return Ok(Rewind::End),
                Some(event) if !self.owns(&event) => return Ok(Rewind::Other(event)),
                Some(event) if event.is_snapshot() => return Ok(Rewind::Snapshot(event)),
                Some(_) => {}
            }
        }
    }

    fn request_reload(&mut self) {
        debug!(
            group_id = %self.group_id,
            aggregate_id = %self.aggregate_id,
            version = self.state.version,
            "projection reload required"
        );
        self.reload = Some(VersionQuery::new(
            self.group_id.clone(),
            self.aggregate_id.clone(),
            self.state.version,
        ));
    }

    async fn pull(&mut self) -> Result<Option<LoadedEvent>, DomainError> {
        let mut pending = self.first.take();
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match self.inner.next().await? {
                    None => return Ok(None),
                    Some(event) if !self.owns(&event) => {
                        self.next_to_process = Some(event);
                        return Ok(None);
                    }
                    Some(event) => event,
                },
            };
            let decision = self.state.update(&event);
            debug!(
                group_id = %self.group_id,
                aggregate_id = %self.aggregate_id,
                version = event.version(),
                event_type = event.event_type(),
                ?decision,
                "projection update"
            );
            match decision {
                Decision::Accept => return Ok(Some(event)),
                Decision::Ignore => {}
                Decision::Reload => match self.rewind_to_snapshot().await? {
                    Rewind::Snapshot(snapshot) => pending = Some(snapshot),
                    Rewind::Other(next) => {
                        self.next_to_process = Some(next);
                        self.request_reload();
                        return Ok(None);
                    }
                    Rewind::End => {
                        self.request_reload();
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Discards whatever the model left unread of this aggregate's run.
    async fn skip_rest(&mut self) -> Result<(), DomainError> {
        self.first = None;
        while !self.done {
            match self.inner.next().await? {
                None => self.done = true,
                Some(event) if !self.owns(&event) => {
                    self.next_to_process = Some(event);
                    self.done = true;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, 'b> EventIter for ReplayIter<'a, 'b> {
    async fn next(&mut self) -> Result<Option<LoadedEvent>, DomainError> {
        if self.done {
            return Ok(None);
        }
        let event = self.pull().await?;
        if event.is_none() {
            self.done = true;
        }
        Ok(event)
    }
}

type SlotMap<M> = HashMap<String, HashMap<String, Arc<Mutex<Slot<M>>>>>;

/// Keeps one model per (group, aggregate) up to date from store streams.
pub struct Projection<M: Model> {
    store: Arc<dyn EventStore>,
    factory: ModelFactory<M>,
    models: RwLock<SlotMap<M>>,
}

impl<M: Model> Projection<M> {
    /// Creates an empty projection over `store`; `factory` builds the model
    /// of each (group, aggregate) the first time one of its events arrives.
    #[must_use]
    pub fn new<F>(store: Arc<dyn EventStore>, factory: F) -> Self
    where
        F: Fn(&str, &str) -> Result<M, DomainError> + Send + Sync + 'static,
    {
        Self {
            store,
            factory: Box::new(factory),
            models: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(
        &self,
        group_id: &str,
        aggregate_id: &str,
    ) -> Result<Arc<Mutex<Slot<M>>>, DomainError> {
        let mut models = self.models.write().await;
        let group = models.entry(group_id.to_owned()).or_default();
        if let Some(slot) = group.get(aggregate_id) {
            return Ok(Arc::clone(slot));
        }
        let model = (self.factory)(group_id, aggregate_id)?;
        debug!(group_id, aggregate_id, "projection created model");
        let slot = Arc::new(Mutex::new(Slot {
            model,
            state: VersionState::default(),
        }));
        group.insert(aggregate_id.to_owned(), Arc::clone(&slot));
        Ok(slot)
    }

    async fn handle_stream(
        &self,
        iter: &mut dyn EventIter,
    ) -> Result<Vec<VersionQuery>, DomainError> {
        let mut reloads = Vec::new();
        let mut current = iter.next().await?;
        while let Some(event) = current {
            let slot = self.slot(event.group_id(), event.aggregate_id()).await?;
            let mut guard = slot.lock().await;
            let Slot { model, state } = &mut *guard;
            let mut replay = ReplayIter::new(&mut *iter, state, event);
            model.handle(&mut replay).await?;
            replay.skip_rest().await?;
            current = replay.next_to_process.take();
            if let Some(query) = replay.reload.take() {
                reloads.push(query);
            }
        }
        Ok(reloads)
    }

    /// Applies `iter`, then issues a single `load_from_version` for every
    /// aggregate whose run had a version gap.
    ///
    /// # Errors
    ///
    /// Returns the first model, factory or store error encountered.
    pub async fn handle_with_reload(&self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        let reloads = self.handle_stream(iter).await?;
        if reloads.is_empty() {
            return Ok(());
        }
        self.store.load_from_version(&reloads, self).await
    }

    /// Loads the selected aggregates from their latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first model, factory or store error encountered.
    pub async fn project(&self, queries: &[SnapshotQuery]) -> Result<(), DomainError> {
        self.store.load_from_snapshot(queries, self).await
    }

    /// Drops the cached models matched by `queries`.
    pub async fn forget(&self, queries: &[SnapshotQuery]) {
        let mut models = self.models.write().await;
        for query in queries {
            match &query.aggregate_id {
                None => {
                    models.remove(&query.group_id);
                }
                Some(aggregate_id) => {
                    if let Some(group) = models.get_mut(&query.group_id) {
                        group.remove(aggregate_id);
                        if group.is_empty() {
                            models.remove(&query.group_id);
                        }
                    }
                }
            }
        }
    }

    /// Visits the cached models matched by `queries` (all models when empty)
    /// until `on_model` returns `false`.
    ///
    /// The map lock is not held while `on_model` runs.
    pub async fn models<F>(&self, queries: &[SnapshotQuery], mut on_model: F)
    where
        F: FnMut(&M) -> bool,
    {
        let selected: Vec<Arc<Mutex<Slot<M>>>> = {
            let models = self.models.read().await;
            models
                .iter()
                .flat_map(|(group_id, group)| {
                    group.iter().filter_map(move |(aggregate_id, slot)| {
                        let wanted = queries.is_empty()
                            || queries.iter().any(|q| q.matches(group_id, aggregate_id));
                        wanted.then(|| Arc::clone(slot))
                    })
                })
                .collect()
        };
        for slot in selected {
            let guard = slot.lock().await;
            if !on_model(&guard.model) {
                return;
            }
        }
    }

    /// Removes the model of one aggregate from the projection and returns it.
    ///
    /// Returns `None` if the aggregate is unknown or its model is still in
    /// use by a concurrent replay, in which case it stays cached.
    pub async fn take(&self, group_id: &str, aggregate_id: &str) -> Option<M> {
        let mut models = self.models.write().await;
        let group = models.get_mut(group_id)?;
        let slot = group.remove(aggregate_id)?;
        match Arc::try_unwrap(slot) {
            Ok(slot) => {
                if group.is_empty() {
                    models.remove(group_id);
                }
                Some(slot.into_inner().model)
            }
            Err(slot) => {
                group.insert(aggregate_id.to_owned(), slot);
                None
            }
        }
    }

    /// Number of cached models.
    pub async fn len(&self) -> usize {
        self.models.read().await.values().map(HashMap::len).sum()
    }

    /// Returns `true` if no model is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<M: Model> Handler for Projection<M> {
    async fn handle(&self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        self.handle_stream(iter).await.map(|_| ())
    }
}
