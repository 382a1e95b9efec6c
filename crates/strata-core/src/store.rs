//! Event store abstraction.

use std::fmt;

use async_trait::async_trait;

use crate::error::DomainError;
use crate::event::{Event, Handler};

/// Outcome of a [`EventStore::save`] call that reached the backend.
///
/// Irrecoverable failures are reported through the `Err` arm of `save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    /// The events were appended.
    Ok,
    /// Another writer appended first; reload and retry.
    ConcurrencyException,
    /// The aggregate's current storage unit is full; the next write must
    /// begin with a snapshot.
    SnapshotRequired,
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::ConcurrencyException => f.write_str("concurrency exception"),
            Self::SnapshotRequired => f.write_str("snapshot required"),
        }
    }
}

/// Selects aggregates to replay from their latest snapshot onward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotQuery {
    /// Group to match.
    pub group_id: String,
    /// Aggregate within the group; `None` selects the whole group.
    pub aggregate_id: Option<String>,
}

impl SnapshotQuery {
    /// Selects every aggregate in `group_id`.
    #[must_use]
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            aggregate_id: None,
        }
    }

    /// Selects a single aggregate.
    #[must_use]
    pub fn aggregate(group_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            aggregate_id: Some(aggregate_id.into()),
        }
    }

    /// Returns `true` if the query selects the given aggregate.
    #[must_use]
    pub fn matches(&self, group_id: &str, aggregate_id: &str) -> bool {
        self.group_id == group_id
            && self
                .aggregate_id
                .as_deref()
                .is_none_or(|id| id == aggregate_id)
    }

    /// # Errors
    ///
    /// Returns `DomainError::InvalidQuery` if an id is empty.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.group_id.is_empty() {
            return Err(DomainError::InvalidQuery("group id is empty".to_owned()));
        }
        if self.aggregate_id.as_deref() == Some("") {
            return Err(DomainError::InvalidQuery(
                "aggregate id is empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Selects one aggregate relative to an explicit version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionQuery {
    /// Group of the aggregate.
    pub group_id: String,
    /// The aggregate.
    pub aggregate_id: String,
    /// Boundary version; inclusive for "from", exclusive for "up to".
    pub version: u64,
}

impl VersionQuery {
    /// Creates a version query.
    #[must_use]
    pub fn new(group_id: impl Into<String>, aggregate_id: impl Into<String>, version: u64) -> Self {
        Self {
            group_id: group_id.into(),
            aggregate_id: aggregate_id.into(),
            version,
        }
    }

    /// # Errors
    ///
    /// Returns `DomainError::InvalidQuery` if an id is empty.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.group_id.is_empty() {
            return Err(DomainError::InvalidQuery("group id is empty".to_owned()));
        }
        if self.aggregate_id.is_empty() {
            return Err(DomainError::InvalidQuery(
                "aggregate id is empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Selects every aggregate of a group for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeleteQuery {
    /// Group to delete.
    pub group_id: String,
}

impl DeleteQuery {
    /// Creates a delete query.
    #[must_use]
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
        }
    }
}

/// Storage backend contract.
///
/// Backends address events by group and aggregate id, order them by version
/// and must be safe to share between any number of aggregates and
/// projections.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to one aggregate.
    ///
    /// The batch is validated with
    /// [`validate_events_before_save`](crate::event::validate_events_before_save)
    /// before any I/O. The write succeeds only if the stored latest version
    /// equals `events[0].version() - 1` (or the aggregate does not exist and
    /// the batch starts at version 0).
    async fn save(&self, events: &[&dyn Event]) -> Result<SaveStatus, DomainError>;

    /// Replays, per matched aggregate, its latest snapshot (if any) followed
    /// by every later event. An empty `queries` slice matches everything.
    async fn load_from_snapshot(
        &self,
        queries: &[SnapshotQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError>;

    /// Replays events with `version >= query.version`.
    async fn load_from_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError>;

    /// Replays events with `version < query.version`.
    async fn load_up_to_version(
        &self,
        queries: &[VersionQuery],
        handler: &dyn Handler,
    ) -> Result<(), DomainError>;

    /// Deletes events (snapshots included) with `version < query.version`.
    /// Meant for backup-then-compact maintenance only.
    async fn remove_up_to_version(&self, queries: &[VersionQuery]) -> Result<(), DomainError>;

    /// Irrecoverably removes every aggregate of the given groups.
    async fn delete(&self, queries: &[DeleteQuery]) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_query_matches_every_aggregate_of_group() {
        let query = SnapshotQuery::group("g1");
        assert!(query.matches("g1", "a1"));
        assert!(query.matches("g1", "a2"));
        assert!(!query.matches("g2", "a1"));
    }

    #[test]
    fn test_aggregate_query_requires_group_match() {
        let query = SnapshotQuery::aggregate("g1", "a1");
        assert!(query.matches("g1", "a1"));
        assert!(!query.matches("g2", "a1"));
        assert!(!query.matches("g1", "a2"));
    }

    #[test]
    fn test_empty_ids_fail_validation() {
        assert!(SnapshotQuery::group("").validate().is_err());
        assert!(SnapshotQuery::aggregate("g1", "").validate().is_err());
        assert!(VersionQuery::new("g1", "", 0).validate().is_err());
        assert!(VersionQuery::new("g1", "a1", 0).validate().is_ok());
    }
}
