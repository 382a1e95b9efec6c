//! In-memory implementation of the `EventStore` trait.
//!
//! Each aggregate keeps its events in append order. The tail of the stream
//! forms the current storage unit. Every snapshot-led batch opens a new unit;
//! an append that would push a unit past `unit_capacity` events is refused
//! with `SnapshotRequired`.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use strata_core::error::DomainError;
use strata_core::event::{
    ETagData, Event, Handler, LoadedEvent, VecIter, validate_events_before_save,
};
use strata_core::store::{DeleteQuery, EventStore, SaveStatus, SnapshotQuery, VersionQuery};

/// Default number of events a storage unit may hold.
pub const DEFAULT_UNIT_CAPACITY: usize = 1024;

type StreamKey = (String, String);

#[derive(Debug)]
struct Stream {
    events: Vec<LoadedEvent>,
    unit_start: usize,
    latest_version: u64,
    latest_timestamp: DateTime<Utc>,
    latest_etag: Option<ETagData>,
}

impl Stream {
    fn unit_len(&self) -> usize {
        self.events.len() - self.unit_start
    }

    fn push(&mut self, batch: Vec<LoadedEvent>, etag: Option<ETagData>) {
        if let Some(last) = batch.last() {
            self.latest_version = last.version();
            self.latest_timestamp = last.timestamp();
        }
        if etag.is_some() {
            self.latest_etag = etag;
        }
        self.events.extend(batch);
    }

    fn append(
        &mut self,
        batch: Vec<LoadedEvent>,
        etag: Option<ETagData>,
        capacity: usize,
    ) -> SaveStatus {
        let Some(first) = batch.first() else {
            return SaveStatus::Ok;
        };
        if self.latest_version.checked_add(1) != Some(first.version()) {
            return SaveStatus::ConcurrencyException;
        }
        if first.is_snapshot() && batch.len() <= capacity {
            self.unit_start = self.events.len();
        } else if self.unit_len() + batch.len() > capacity {
            return SaveStatus::SnapshotRequired;
        }
        self.push(batch, etag);
        SaveStatus::Ok
    }

    /// Latest snapshot and everything after it, or the whole stream.
    fn from_latest_snapshot(&self) -> &[LoadedEvent] {
        let start = self
            .events
            .iter()
            .rposition(LoadedEvent::is_snapshot)
            .unwrap_or(0);
        &self.events[start..]
    }

    fn remove_below(&mut self, version: u64) {
        let kept_before_unit = self.events[..self.unit_start]
            .iter()
            .filter(|e| e.version() >= version)
            .count();
        self.events.retain(|e| e.version() >= version);
        self.unit_start = kept_before_unit;
    }
}

/// Event store holding every stream in process memory.
#[derive(Debug)]
pub struct InMemoryEventStore {
    unit_capacity: usize,
    streams: RwLock<BTreeMap<StreamKey, Stream>>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Creates an empty store with [`DEFAULT_UNIT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            unit_capacity: DEFAULT_UNIT_CAPACITY,
            streams: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates an empty store whose storage units hold at most `capacity`
    /// events (at least one).
    #[must_use]
    pub fn with_unit_capacity(capacity: usize) -> Self {
        Self {
            unit_capacity: capacity.max(1),
            streams: RwLock::new(BTreeMap::new()),
        }
    }

    /// Latest stored version of an aggregate.
    pub async fn latest_version(&self, group_id: &str, aggregate_id: &str) -> Option<u64> {
        let streams = self.streams.read().await;
        streams
            .get(&(group_id.to_owned(), aggregate_id.to_owned()))
            .map(|s| s.latest_version)
    }

    /// Timestamp of the latest stored event of an aggregate.
    pub async fn latest_timestamp(
        &self,
        group_id: &str,
        aggregate_id: &str,
    ) -> Option<DateTime<Utc>> {
        let streams = self.streams.read().await;
        streams
            .get(&(group_id.to_owned(), aggregate_id.to_owned()))
            .map(|s| s.latest_timestamp)
    }

    /// Most recent consistency tag saved for an aggregate.
    pub async fn latest_etag(&self, group_id: &str, aggregate_id: &str) -> Option<ETagData> {
        let streams = self.streams.read().await;
        streams
            .get(&(group_id.to_owned(), aggregate_id.to_owned()))
            .and_then(|s| s.latest_etag.clone())
    }

    async fn collect_versions<P>(
        &self,
        queries: &[VersionQuery],
        keep: P,
    ) -> Result<Vec<LoadedEvent>, DomainError>
    where
        P: Fn(u64, u64) -> bool,
    {
        let mut bounds = BTreeMap::new();
        for query in queries {
            query.validate()?;
            bounds.insert(
                (query.group_id.clone(), query.aggregate_id.clone()),
                query.version,
            );
        }
        let keep = &keep;
        let streams = self.streams.read().await;
        Ok(bounds
            .iter()
            .filter_map(|(key, bound)| streams.get(key).map(|s| (s, *bound)))
            .flat_map(|(stream, bound)| {
                stream
                    .events
                    .iter()
                    .filter(move |e| keep(e.version(), bound))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn replay(events: Vec<LoadedEvent>, handler: &dyn Handler) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }
        debug!(count = events.len(), "replaying events");
        handler.handle(&mut VecIter::new(events)).await
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(&self, events: &[&dyn Event]) -> Result<SaveStatus, DomainError> {
        validate_events_before_save(events)?;
        let Some(first) = events.first() else {
            return Err(DomainError::InvalidEvents("empty batch".to_owned()));
        };
        let batch = events
            .iter()
            .map(|e| LoadedEvent::from_event(*e))
            .collect::<Result<Vec<_>, _>>()?;
        let etag = events.iter().rev().find_map(|e| e.etag().cloned());
        let key = (first.group_id().to_owned(), first.aggregate_id().to_owned());

        let mut streams = self.streams.write().await;
        let status = if let Some(stream) = streams.get_mut(&key) {
            stream.append(batch, etag, self.unit_capacity)
        } else if streams.keys().any(|(_, a)| *a == key.1) {
            return Err(DomainError::InvalidEvents(format!(
                "aggregate id {} already used by another group",
                key.1
            )));
        } else if first.version() != 0 {
            SaveStatus::ConcurrencyException
        } else if batch.len() > self.unit_capacity {
            SaveStatus::SnapshotRequired
        } else {
            let mut stream = Stream {
                events: Vec::with_capacity(batch.len()),
                unit_start: 0,
                latest_version: 0,
                latest_timestamp: first.timestamp(),
                latest_etag: None,
            };
            stream.push(batch, etag);
            streams.insert(key.clone(), stream);
            SaveStatus::Ok
        };
        debug!(
            group_id = %key.0,
            aggregate_id = %key.1,
            version = first.version(),
            count = events.len(),
            %status,
            "save"
        );
        Ok(status)
    }

    async fn load_from_snapshot(
        &self,
        queries: &[SnapshotQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        for query in queries {
            query.validate()?;
        }
        let events: Vec<LoadedEvent> = {
            let streams = self.streams.read().await;
            streams
                .iter()
                .filter(|((g, a), _)| queries.is_empty() || queries.iter().any(|q| q.matches(g, a)))
                .flat_map(|(_, stream)| stream.from_latest_snapshot().iter().cloned())
                .collect()
        };
        Self::replay(events, handler).await
    }

    async fn load_from_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        let events = self
            .collect_versions(queries, |version, bound| version >= bound)
            .await?;
        Self::replay(events, handler).await
    }

    async fn load_up_to_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError> {
        let events = self
            .collect_versions(queries, |version, bound| version < bound)
            .await?;
        Self::replay(events, handler).await
    }

    async fn remove_up_to_version(&self, queries: &[VersionQuery]) -> Result<(), DomainError> {
        for query in queries {
            query.validate()?;
        }
        let mut streams = self.streams.write().await;
        for query in queries {
            let key = (query.group_id.clone(), query.aggregate_id.clone());
            if let Some(stream) = streams.get_mut(&key) {
                stream.remove_below(query.version);
                debug!(
                    group_id = %query.group_id,
                    aggregate_id = %query.aggregate_id,
                    version = query.version,
                    "removed events below version"
                );
            }
        }
        Ok(())
    }

    async fn delete(&self, queries: &[DeleteQuery]) -> Result<(), DomainError> {
        if queries.is_empty() {
            return Err(DomainError::InvalidQuery("no groups to delete".to_owned()));
        }
        if queries.iter().any(|q| q.group_id.is_empty()) {
            return Err(DomainError::InvalidQuery("group id is empty".to_owned()));
        }
        let groups: HashSet<&str> = queries.iter().map(|q| q.group_id.as_str()).collect();
        let mut streams = self.streams.write().await;
        streams.retain(|(group_id, _), _| !groups.contains(group_id.as_str()));
        debug!(groups = groups.len(), "deleted groups");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(version: u64, snapshot: bool) -> LoadedEvent {
        LoadedEvent::new(
            version,
            "t",
            "a1",
            "g1",
            snapshot,
            Utc::now(),
            None,
            serde_json::Value::Null,
        )
    }

    fn stream_of(versions: &[(u64, bool)]) -> Stream {
        let mut stream = Stream {
            events: Vec::new(),
            unit_start: 0,
            latest_version: 0,
            latest_timestamp: Utc::now(),
            latest_etag: None,
        };
        stream.push(versions.iter().map(|(v, s)| loaded(*v, *s)).collect(), None);
        stream
    }

    #[test]
    fn test_full_unit_requires_snapshot() {
        // Arrange
        let mut stream = stream_of(&[(0, false), (1, false)]);

        // Act
        let plain = stream.append(vec![loaded(2, false)], None, 2);
        let snapshot = stream.append(vec![loaded(2, true), loaded(3, false)], None, 2);

        // Assert
        assert_eq!(plain, SaveStatus::SnapshotRequired);
        assert_eq!(snapshot, SaveStatus::Ok);
        assert_eq!(stream.unit_start, 2);
        assert_eq!(stream.unit_len(), 2);
        assert_eq!(stream.latest_version, 3);
    }

    #[test]
    fn test_append_checks_previous_version() {
        let mut stream = stream_of(&[(0, false), (1, false)]);
        assert_eq!(
            stream.append(vec![loaded(1, false)], None, 8),
            SaveStatus::ConcurrencyException
        );
        assert_eq!(
            stream.append(vec![loaded(3, false)], None, 8),
            SaveStatus::ConcurrencyException
        );
    }

    #[test]
    fn test_from_latest_snapshot_skips_older_events() {
        let stream = stream_of(&[(0, false), (1, true), (2, false), (3, true), (4, false)]);
        let versions: Vec<u64> = stream
            .from_latest_snapshot()
            .iter()
            .map(LoadedEvent::version)
            .collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[test]
    fn test_remove_below_keeps_unit_boundary() {
        // Arrange
        let mut stream = stream_of(&[(0, false), (1, false)]);
        stream.append(vec![loaded(2, true), loaded(3, false)], None, 2);

        // Act
        stream.remove_below(1);

        // Assert
        assert_eq!(stream.events.len(), 3);
        assert_eq!(stream.unit_start, 1);
        assert_eq!(stream.latest_version, 3);
    }
}
