//! Test events and handlers.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::DomainError;
use strata_core::event::{ETagData, Event, EventIter, Handler, LoadedEvent};

/// A self-describing event; its payload is the event itself, so a loaded
/// copy decodes back into an equal `MockEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockEvent {
    pub version: u64,
    pub event_type: String,
    pub aggregate_id: String,
    pub group_id: String,
    pub is_snapshot: bool,
    pub timestamp: DateTime<Utc>,
    pub service_id: Option<String>,
    pub etag: Option<ETagData>,
    pub data: serde_json::Value,
}

impl MockEvent {
    /// Creates a plain (non-snapshot) event.
    #[must_use]
    pub fn new(group_id: &str, aggregate_id: &str, version: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            version,
            event_type: "mock".to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            group_id: group_id.to_owned(),
            is_snapshot: false,
            timestamp,
            service_id: None,
            etag: None,
            data: serde_json::Value::Null,
        }
    }

    /// Turns the event into a snapshot.
    #[must_use]
    pub fn snapshot(mut self) -> Self {
        self.is_snapshot = true;
        self.event_type = "snapshot".to_owned();
        self
    }

    /// Attaches a consistency tag.
    #[must_use]
    pub fn with_etag(mut self, etag: &[u8]) -> Self {
        self.etag = Some(ETagData {
            etag: etag.to_vec(),
            timestamp: self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
        });
        self
    }

    /// Decodes a loaded copy of a `MockEvent`.
    ///
    /// # Panics
    ///
    /// Panics if the payload was not produced by a `MockEvent`.
    #[must_use]
    pub fn from_loaded(event: &LoadedEvent) -> Self {
        event.decode().unwrap()
    }
}

impl Event for MockEvent {
    fn version(&self) -> u64 {
        self.version
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    fn etag(&self) -> Option<&ETagData> {
        self.etag.as_ref()
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        serde_json::to_value(self).map_err(|source| DomainError::Encode {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

/// Builds `count` consecutive events starting at `from_version`, one second
/// apart, the first one optionally a snapshot.
#[must_use]
pub fn mock_events(
    from_version: u64,
    count: u64,
    first_is_snapshot: bool,
    group_id: &str,
    aggregate_id: &str,
    start: DateTime<Utc>,
) -> Vec<MockEvent> {
    (from_version..from_version + count)
        .map(|version| {
            let offset = i64::try_from(version).unwrap_or(i64::MAX);
            let event = MockEvent::new(
                group_id,
                aggregate_id,
                version,
                start + Duration::seconds(offset),
            );
            if first_is_snapshot && version == from_version {
                event.snapshot()
            } else {
                event
            }
        })
        .collect()
}

/// Borrows a batch as trait objects for `EventStore::save`.
#[must_use]
pub fn as_dyn(events: &[MockEvent]) -> Vec<&dyn Event> {
    events.iter().map(|e| e as &dyn Event).collect()
}

/// A handler that stores every event it is fed.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    events: Mutex<Vec<LoadedEvent>>,
}

impl CollectingHandler {
    /// Creates an empty handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn events(&self) -> Vec<LoadedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Versions received for one aggregate, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn versions(&self, group_id: &str, aggregate_id: &str) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.group_id() == group_id && e.aggregate_id() == aggregate_id)
            .map(LoadedEvent::version)
            .collect()
    }

    /// Number of events received.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Returns `true` if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Handler for CollectingHandler {
    async fn handle(&self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        while let Some(event) = iter.next().await? {
            self.events.lock().unwrap().push(event);
        }
        Ok(())
    }
}
