//! Domain events for the device resource context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::error::DomainError;
use strata_core::event::Event;
use uuid::Uuid;

/// Suffix appended to a device id to name its resource links aggregate.
pub const RESOURCE_LINKS_HREF: &str = "/links";

/// Aggregate id of the resource at `href` on `device_id`.
#[must_use]
pub fn resource_aggregate_id(device_id: &str, href: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{device_id}{href}").as_bytes()).to_string()
}

/// Aggregate id of the resource links of `device_id`.
#[must_use]
pub fn links_aggregate_id(device_id: &str) -> String {
    resource_aggregate_id(device_id, RESOURCE_LINKS_HREF)
}

/// A resource as announced by its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Path of the resource on the device.
    pub href: String,
    /// Device exposing the resource.
    pub device_id: String,
    /// Resource types the resource implements.
    pub resource_types: Vec<String>,
    /// Interfaces the resource supports.
    pub interfaces: Vec<String>,
}

/// Representation of a resource at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Media type of `data`.
    pub content_type: String,
    /// The representation itself.
    pub data: serde_json::Value,
}

/// Emitted when a device publishes a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePublished {
    /// The published resource.
    pub resource: Resource,
}

/// Emitted when a device withdraws a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUnpublished {
    /// Path of the withdrawn resource.
    pub href: String,
}

/// Emitted when a device reports new content for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChanged {
    /// The reported content.
    pub content: Content,
    /// Connection the report arrived on.
    pub connection_id: String,
    /// Sequence number of the report within its connection.
    pub sequence: u64,
}

/// Full state of a resource aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStateSnapshotTaken {
    /// The resource, once published at least once.
    pub resource: Option<Resource>,
    /// Whether the resource is currently published.
    pub is_published: bool,
    /// The latest accepted content report.
    pub latest_change: Option<ResourceChanged>,
}

/// Emitted when a device publishes new or changed links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLinksPublished {
    /// Links that were added or changed.
    pub resources: Vec<Resource>,
}

/// Emitted when a device withdraws links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLinksUnpublished {
    /// Paths of the withdrawn links.
    pub hrefs: Vec<String>,
}

/// Full state of a resource links aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLinksSnapshotTaken {
    /// Every published link, ordered by href.
    pub resources: Vec<Resource>,
}

/// Event payload variants for the device resource context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceEventKind {
    /// A resource was published.
    ResourcePublished(ResourcePublished),
    /// A resource was unpublished.
    ResourceUnpublished(ResourceUnpublished),
    /// A resource reported new content.
    ResourceChanged(ResourceChanged),
    /// Snapshot of a resource aggregate.
    ResourceStateSnapshotTaken(ResourceStateSnapshotTaken),
    /// Links were published.
    ResourceLinksPublished(ResourceLinksPublished),
    /// Links were unpublished.
    ResourceLinksUnpublished(ResourceLinksUnpublished),
    /// Snapshot of a resource links aggregate.
    ResourceLinksSnapshotTaken(ResourceLinksSnapshotTaken),
}

/// Envelope fields shared by every resource event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    /// Device the aggregate belongs to; the stream group.
    pub device_id: String,
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Version within the aggregate stream.
    pub version: u64,
    /// When the event was produced.
    pub occurred_at: DateTime<Utc>,
}

/// Domain event envelope for the device resource context.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: ResourceEventKind,
}

impl Event for ResourceEvent {
    fn version(&self) -> u64 {
        self.metadata.version
    }

    fn event_type(&self) -> &str {
        match &self.kind {
            ResourceEventKind::ResourcePublished(_) => "resource.published",
            ResourceEventKind::ResourceUnpublished(_) => "resource.unpublished",
            ResourceEventKind::ResourceChanged(_) => "resource.changed",
            ResourceEventKind::ResourceStateSnapshotTaken(_) => "resource.state_snapshot_taken",
            ResourceEventKind::ResourceLinksPublished(_) => "resource_links.published",
            ResourceEventKind::ResourceLinksUnpublished(_) => "resource_links.unpublished",
            ResourceEventKind::ResourceLinksSnapshotTaken(_) => "resource_links.snapshot_taken",
        }
    }

    fn aggregate_id(&self) -> &str {
        &self.metadata.aggregate_id
    }

    fn group_id(&self) -> &str {
        &self.metadata.device_id
    }

    fn is_snapshot(&self) -> bool {
        matches!(
            self.kind,
            ResourceEventKind::ResourceStateSnapshotTaken(_)
                | ResourceEventKind::ResourceLinksSnapshotTaken(_)
        )
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }

    fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
        serde_json::to_value(&self.kind).map_err(|source| DomainError::Encode {
            event_type: self.event_type().to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_ids_are_stable_and_distinct() {
        let first = resource_aggregate_id("device-1", "/light/1");
        let again = resource_aggregate_id("device-1", "/light/1");
        let other_device = resource_aggregate_id("device-2", "/light/1");

        assert_eq!(first, again);
        assert_ne!(first, other_device);
        assert_ne!(links_aggregate_id("device-1"), first);
        assert_eq!(
            links_aggregate_id("device-1"),
            resource_aggregate_id("device-1", "/links")
        );
    }

    #[test]
    fn test_only_snapshot_kinds_are_snapshots() {
        let metadata = EventMetadata {
            device_id: "device-1".to_owned(),
            aggregate_id: links_aggregate_id("device-1"),
            version: 3,
            occurred_at: Utc::now(),
        };
        let snapshot = ResourceEvent {
            metadata: metadata.clone(),
            kind: ResourceEventKind::ResourceLinksSnapshotTaken(ResourceLinksSnapshotTaken {
                resources: Vec::new(),
            }),
        };
        let published = ResourceEvent {
            metadata,
            kind: ResourceEventKind::ResourceLinksPublished(ResourceLinksPublished {
                resources: Vec::new(),
            }),
        };

        assert!(snapshot.is_snapshot());
        assert!(!published.is_snapshot());
        assert_eq!(snapshot.event_type(), "resource_links.snapshot_taken");
    }
}
