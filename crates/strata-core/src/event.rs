//! Event and stream primitives.
//!
//! The write side produces values implementing [`Event`]; the read side only
//! ever sees [`LoadedEvent`]s handed out by a store's [`EventIter`]. Stream
//! consumers come in two shapes: a [`Handler`] is driven by a store with a
//! stream that may span many aggregates, a [`Model`] is fed the events of a
//! single aggregate.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Opaque consistency tag attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ETagData {
    /// Tag bytes as produced by the originating device or service.
    pub etag: Vec<u8>,
    /// Unix nanoseconds at which the tag was issued.
    pub timestamp: i64,
}

/// Trait that all persisted domain events implement.
pub trait Event: Send + Sync + fmt::Debug {
    /// Version within the aggregate stream, zero-based.
    fn version(&self) -> u64;

    /// Type discriminator used to route decoding.
    fn event_type(&self) -> &str;

    /// Aggregate this event belongs to.
    fn aggregate_id(&self) -> &str;

    /// Group (owner) the aggregate belongs to.
    fn group_id(&self) -> &str;

    /// Whether the event carries the full reconstructable state.
    fn is_snapshot(&self) -> bool;

    /// Timestamp of event creation.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Identifier of the service that produced the event, if any.
    fn service_id(&self) -> Option<&str> {
        None
    }

    /// Consistency tag carried by the event, if any.
    fn etag(&self) -> Option<&ETagData> {
        None
    }

    /// Serializes the event payload to JSON.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Encode` if the payload cannot be serialized.
    fn to_payload(&self) -> Result<serde_json::Value, DomainError>;
}

/// A persisted event as seen by readers.
///
/// The payload stays undecoded until a consumer asks for it with
/// [`LoadedEvent::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedEvent {
    version: u64,
    event_type: String,
    aggregate_id: String,
    group_id: String,
    is_snapshot: bool,
    timestamp: DateTime<Utc>,
    service_id: Option<String>,
    payload: serde_json::Value,
}

impl LoadedEvent {
    /// Creates a loaded event from its stored parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u64,
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        group_id: impl Into<String>,
        is_snapshot: bool,
        timestamp: DateTime<Utc>,
        service_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            version,
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            group_id: group_id.into(),
            is_snapshot,
            timestamp,
            service_id,
            payload,
        }
    }

    /// Captures a write-side event as it would be read back from a store.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Encode` if the payload cannot be serialized.
    pub fn from_event(event: &dyn Event) -> Result<Self, DomainError> {
        Ok(Self::new(
            event.version(),
            event.event_type(),
            event.aggregate_id(),
            event.group_id(),
            event.is_snapshot(),
            event.timestamp(),
            event.service_id().map(str::to_owned),
            event.to_payload()?,
        ))
    }

    /// Version within the aggregate stream.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Type discriminator.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Aggregate this event belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Group the aggregate belongs to.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Whether this event is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    /// Timestamp of event creation.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Identifier of the producing service, if recorded.
    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Raw JSON payload.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Returns `true` if both events belong to the same (group, aggregate).
    #[must_use]
    pub fn same_aggregate(&self, other: &LoadedEvent) -> bool {
        self.group_id == other.group_id && self.aggregate_id == other.aggregate_id
    }

    /// Decodes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        T::deserialize(&self.payload).map_err(|source| DomainError::Decode {
            event_type: self.event_type.clone(),
            version: self.version,
            source,
        })
    }
}

/// Sequence of loaded events, oldest first.
#[async_trait]
pub trait EventIter: Send {
    /// Returns the next event, `Ok(None)` once the sequence is exhausted.
    async fn next(&mut self) -> Result<Option<LoadedEvent>, DomainError>;
}

/// An [`EventIter`] over events already held in memory.
#[derive(Debug, Default)]
pub struct VecIter {
    events: VecDeque<LoadedEvent>,
}

impl VecIter {
    /// Creates an iterator yielding `events` in order.
    #[must_use]
    pub fn new(events: Vec<LoadedEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[async_trait]
impl EventIter for VecIter {
    async fn next(&mut self) -> Result<Option<LoadedEvent>, DomainError> {
        Ok(self.events.pop_front())
    }
}

/// Consumer of a store stream that may interleave many aggregates.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Consumes events from `iter`.
    async fn handle(&self, iter: &mut dyn EventIter) -> Result<(), DomainError>;
}

/// User model rebuilt from the events of a single aggregate.
#[async_trait]
pub trait Model: Send + 'static {
    /// Applies the events yielded by `iter` to the model state.
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError>;
}

fn invalid(index: usize, reason: &str) -> DomainError {
    DomainError::InvalidEvents(format!("event[{index}]: {reason}"))
}

/// Checks a batch against the invariants every store enforces before I/O.
///
/// All events must share group and aggregate, carry consecutive versions and
/// non-decreasing timestamps, agree on the service id, and only the first
/// event may be a snapshot.
///
/// # Errors
///
/// Returns `DomainError::InvalidEvents` describing the first violation found.
pub fn validate_events_before_save(events: &[&dyn Event]) -> Result<(), DomainError> {
    let Some(first) = events.first() else {
        return Err(DomainError::InvalidEvents("empty batch".to_owned()));
    };
    for (index, event) in events.iter().enumerate() {
        if event.group_id().is_empty() {
            return Err(invalid(index, "group id is empty"));
        }
        if event.aggregate_id().is_empty() {
            return Err(invalid(index, "aggregate id is empty"));
        }
        if event.event_type().is_empty() {
            return Err(invalid(index, "event type is empty"));
        }
        if event.timestamp() == DateTime::<Utc>::UNIX_EPOCH {
            return Err(invalid(index, "timestamp is not set"));
        }
        if index == 0 {
            continue;
        }
        let prev = events[index - 1];
        if event.group_id() != first.group_id() {
            return Err(invalid(index, "group id differs within batch"));
        }
        if event.aggregate_id() != first.aggregate_id() {
            return Err(invalid(index, "aggregate id differs within batch"));
        }
        if prev.version().checked_add(1) != Some(event.version()) {
            return Err(invalid(
                index,
                &format!(
                    "version {} does not follow {}",
                    event.version(),
                    prev.version()
                ),
            ));
        }
        if event.timestamp() < prev.timestamp() {
            return Err(invalid(index, "timestamp is older than previous event"));
        }
        if event.is_snapshot() {
            return Err(invalid(index, "only the first event may be a snapshot"));
        }
        if event.service_id() != first.service_id() {
            return Err(invalid(index, "service id differs within batch"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[derive(Debug, Clone)]
    struct TestEvent {
        version: u64,
        event_type: String,
        aggregate_id: String,
        group_id: String,
        is_snapshot: bool,
        timestamp: DateTime<Utc>,
        service_id: Option<String>,
    }

    impl Event for TestEvent {
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
        fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
            Ok(serde_json::json!({ "version": self.version }))
        }
    }

    fn base() -> TestEvent {
        TestEvent {
            version: 1,
            event_type: "event-type".to_owned(),
            aggregate_id: "d9e7e4a0-49b7-4e6e-8f00-9ebefb3f6f5d".to_owned(),
            group_id: "d9e7e4a0-49b7-4e6e-8f00-9ebefb3f6f5d".to_owned(),
            is_snapshot: false,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            service_id: None,
        }
    }

    fn next_of(ev: &TestEvent) -> TestEvent {
        TestEvent {
            version: ev.version + 1,
            timestamp: ev.timestamp + Duration::seconds(1),
            is_snapshot: false,
            ..ev.clone()
        }
    }

    fn validate(events: &[TestEvent]) -> Result<(), DomainError> {
        let refs: Vec<&dyn Event> = events.iter().map(|e| e as &dyn Event).collect();
        validate_events_before_save(&refs)
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        assert!(validate(&[]).is_err());
    }

    #[test]
    fn test_first_event_missing_ids_is_rejected() {
        let mut no_group = base();
        no_group.group_id.clear();
        assert!(validate(&[no_group]).is_err());

        let mut no_aggregate = base();
        no_aggregate.aggregate_id.clear();
        assert!(validate(&[no_aggregate]).is_err());
    }

    #[test]
    fn test_unset_timestamp_is_rejected() {
        let mut ev = base();
        ev.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        assert!(validate(&[ev]).is_err());
    }

    #[test]
    fn test_second_event_with_repeated_version_is_rejected() {
        let first = base();
        let mut second = next_of(&first);
        second.version = first.version;
        assert!(validate(&[first, second]).is_err());
    }

    #[test]
    fn test_second_event_with_empty_type_is_rejected() {
        let first = base();
        let mut second = next_of(&first);
        second.event_type.clear();
        assert!(validate(&[first, second]).is_err());
    }

    #[test]
    fn test_second_event_with_other_ids_is_rejected() {
        let first = base();
        let mut other_group = next_of(&first);
        other_group.group_id = "d9e7e4a0-49b7-4e6e-8f00-9ebefb3f6f5e".to_owned();
        assert!(validate(&[first.clone(), other_group]).is_err());

        let mut other_aggregate = next_of(&first);
        other_aggregate.aggregate_id = "d9e7e4a0-49b7-4e6e-8f00-9ebefb3f6f5e".to_owned();
        assert!(validate(&[first, other_aggregate]).is_err());
    }

    #[test]
    fn test_second_event_with_service_id_is_rejected() {
        let first = base();
        let mut second = next_of(&first);
        second.service_id = Some("invalid-service-id".to_owned());
        assert!(validate(&[first, second]).is_err());
    }

    #[test]
    fn test_timestamp_in_past_is_rejected() {
        let first = base();
        let mut second = next_of(&first);
        second.timestamp = first.timestamp - Duration::seconds(1);
        assert!(validate(&[first, second]).is_err());
    }

    #[test]
    fn test_snapshot_after_first_position_is_rejected() {
        let first = base();
        let mut second = next_of(&first);
        second.is_snapshot = true;
        assert!(validate(&[first, second]).is_err());
    }

    #[test]
    fn test_leading_snapshot_and_consecutive_events_are_accepted() {
        let mut first = base();
        first.is_snapshot = true;
        let second = next_of(&first);
        let third = next_of(&second);
        assert!(validate(&[first, second, third]).is_ok());
    }

    #[test]
    fn test_decode_reports_event_type() {
        let event = LoadedEvent::new(
            4,
            "snapshot",
            "a1",
            "g1",
            true,
            Utc::now(),
            None,
            serde_json::json!({ "published": "yes" }),
        );

        #[derive(Debug, Deserialize)]
        struct Target {
            #[allow(dead_code)]
            published: bool,
        }

        match event.decode::<Target>() {
            Err(DomainError::Decode {
                event_type,
                version,
                ..
            }) => {
                assert_eq!(event_type, "snapshot");
                assert_eq!(version, 4);
            }
            other => panic!("expected Decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vec_iter_yields_in_order_then_none() {
        let ts = Utc::now();
        let mut iter = VecIter::new(vec![
            LoadedEvent::new(0, "t", "a1", "g1", false, ts, None, serde_json::Value::Null),
            LoadedEvent::new(1, "t", "a1", "g1", false, ts, None, serde_json::Value::Null),
        ]);

        assert_eq!(iter.next().await.unwrap().unwrap().version(), 0);
        assert_eq!(iter.next().await.unwrap().unwrap().version(), 1);
        assert!(iter.next().await.unwrap().is_none());
    }
}
