//! Aggregate models for the device resource context.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::aggregate::AggregateModel;
use strata_core::clock::Clock;
use strata_core::error::DomainError;
use strata_core::event::{EventIter, LoadedEvent, Model};

use super::commands::{ResourceLinksCommand, ResourceStateCommand};
use super::events::{
    Content, EventMetadata, Resource, ResourceChanged, ResourceEvent, ResourceEventKind,
    ResourceLinksPublished, ResourceLinksSnapshotTaken, ResourceLinksUnpublished,
    ResourcePublished, ResourceStateSnapshotTaken, ResourceUnpublished, links_aggregate_id,
    resource_aggregate_id,
};

/// Stream position and time floor shared by both models.
struct Position {
    version: Option<u64>,
    last_timestamp: DateTime<Utc>,
}

impl Position {
    fn new() -> Self {
        Self {
            version: None,
            last_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn advance(&mut self, event: &LoadedEvent) {
        self.version = Some(event.version());
        self.last_timestamp = self.last_timestamp.max(event.timestamp());
    }
}

/// Published state and latest content of one device resource.
pub struct ResourceState {
    device_id: String,
    aggregate_id: String,
    href: String,
    resource: Option<Resource>,
    is_published: bool,
    latest_change: Option<ResourceChanged>,
    position: Position,
    clock: Arc<dyn Clock>,
}

impl ResourceState {
    /// Creates the model for the resource at `href` on `device_id`.
    #[must_use]
    pub fn new(device_id: &str, href: &str, clock: Arc<dyn Clock>) -> Self {
        let aggregate_id = resource_aggregate_id(device_id, href);
        let mut state = Self::for_aggregate(device_id, &aggregate_id, clock);
        state.href = href.to_owned();
        state
    }

    /// Creates the model for an aggregate whose href is learned from its
    /// events.
    #[must_use]
    pub fn for_aggregate(device_id: &str, aggregate_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_id: device_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            href: String::new(),
            resource: None,
            is_published: false,
            latest_change: None,
            position: Position::new(),
            clock,
        }
    }

    /// Device exposing the resource.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Path of the resource; empty until known.
    #[must_use]
    pub fn href(&self) -> &str {
        &self.href
    }

    /// The resource as last published.
    #[must_use]
    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    /// Whether the resource is currently published.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.is_published
    }

    /// Content of the latest accepted change.
    #[must_use]
    pub fn latest_content(&self) -> Option<&Content> {
        self.latest_change.as_ref().map(|change| &change.content)
    }

    /// Version of the last applied event.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.position.version
    }

    fn apply(&mut self, event: &LoadedEvent) -> Result<(), DomainError> {
        match event.decode::<ResourceEventKind>()? {
            ResourceEventKind::ResourcePublished(published) => {
                self.href.clone_from(&published.resource.href);
                self.resource = Some(published.resource);
                self.is_published = true;
            }
            ResourceEventKind::ResourceUnpublished(_) => self.is_published = false,
            ResourceEventKind::ResourceChanged(changed) => self.latest_change = Some(changed),
            ResourceEventKind::ResourceStateSnapshotTaken(snapshot) => {
                if let Some(resource) = &snapshot.resource {
                    self.href.clone_from(&resource.href);
                }
                self.resource = snapshot.resource;
                self.is_published = snapshot.is_published;
                self.latest_change = snapshot.latest_change;
            }
            _ => {}
        }
        self.position.advance(event);
        Ok(())
    }

    /// A change is stale when an earlier or equal sequence number of the same
    /// connection was already accepted.
    fn accepts(&self, connection_id: &str, sequence: u64) -> bool {
        match &self.latest_change {
            None => true,
            Some(latest) => latest.connection_id != connection_id || latest.sequence < sequence,
        }
    }

    fn event(&self, version: u64, kind: ResourceEventKind) -> ResourceEvent {
        ResourceEvent {
            metadata: EventMetadata {
                device_id: self.device_id.clone(),
                aggregate_id: self.aggregate_id.clone(),
                version,
                occurred_at: self.clock.now_not_before(self.position.last_timestamp),
            },
            kind,
        }
    }

    fn check_target(&self, device_id: &str, href: &str) -> Result<(), DomainError> {
        if resource_aggregate_id(device_id, href) == self.aggregate_id {
            Ok(())
        } else {
            Err(DomainError::Validation(format!(
                "resource {device_id}{href} does not belong to aggregate {}",
                self.aggregate_id
            )))
        }
    }
}

#[async_trait]
impl Model for ResourceState {
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        while let Some(event) = iter.next().await? {
            self.apply(&event)?;
        }
        Ok(())
    }
}

impl AggregateModel for ResourceState {
    type Command = ResourceStateCommand;
    type Event = ResourceEvent;

    fn handle_command(
        &self,
        command: &ResourceStateCommand,
        new_version: u64,
    ) -> Result<Vec<ResourceEvent>, DomainError> {
        self.check_target(command.device_id(), command.href())?;
        match command {
            ResourceStateCommand::Publish(cmd) => {
                if self.is_published {
                    return Err(DomainError::Validation(
                        "resource is already published".to_owned(),
                    ));
                }
                Ok(vec![self.event(
                    new_version,
                    ResourceEventKind::ResourcePublished(ResourcePublished {
                        resource: cmd.resource.clone(),
                    }),
                )])
            }
            ResourceStateCommand::Unpublish(cmd) => {
                if self.resource.is_none() {
                    return Err(DomainError::Validation("resource not found".to_owned()));
                }
                if !self.is_published {
                    return Err(DomainError::Validation(
                        "resource is already unpublished".to_owned(),
                    ));
                }
                Ok(vec![self.event(
                    new_version,
                    ResourceEventKind::ResourceUnpublished(ResourceUnpublished {
                        href: cmd.href.clone(),
                    }),
                )])
            }
            ResourceStateCommand::ChangeContent(cmd) => {
                if !self.is_published {
                    return Err(DomainError::Validation("resource is unpublished".to_owned()));
                }
                if !self.accepts(&cmd.connection_id, cmd.sequence) {
                    return Ok(Vec::new());
                }
                Ok(vec![self.event(
                    new_version,
                    ResourceEventKind::ResourceChanged(ResourceChanged {
                        content: cmd.content.clone(),
                        connection_id: cmd.connection_id.clone(),
                        sequence: cmd.sequence,
                    }),
                )])
            }
        }
    }

    fn take_snapshot(&self, version: u64) -> Option<ResourceEvent> {
        Some(self.event(
            version,
            ResourceEventKind::ResourceStateSnapshotTaken(ResourceStateSnapshotTaken {
                resource: self.resource.clone(),
                is_published: self.is_published,
                latest_change: self.latest_change.clone(),
            }),
        ))
    }

    fn group_id(&self) -> &str {
        &self.device_id
    }
}

/// The set of links a device currently publishes.
pub struct ResourceLinks {
    device_id: String,
    aggregate_id: String,
    resources: BTreeMap<String, Resource>,
    position: Position,
    clock: Arc<dyn Clock>,
}

impl ResourceLinks {
    /// Creates the links model of `device_id`.
    #[must_use]
    pub fn new(device_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_id: device_id.to_owned(),
            aggregate_id: links_aggregate_id(device_id),
            resources: BTreeMap::new(),
            position: Position::new(),
            clock,
        }
    }

    /// Device owning the links.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Published links ordered by href.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Version of the last applied event.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.position.version
    }

    fn apply(&mut self, event: &LoadedEvent) -> Result<(), DomainError> {
        match event.decode::<ResourceEventKind>()? {
            ResourceEventKind::ResourceLinksPublished(published) => {
                for resource in published.resources {
                    self.resources.insert(resource.href.clone(), resource);
                }
            }
            ResourceEventKind::ResourceLinksUnpublished(unpublished) => {
                for href in &unpublished.hrefs {
                    self.resources.remove(href);
                }
            }
            ResourceEventKind::ResourceLinksSnapshotTaken(snapshot) => {
                self.resources = snapshot
                    .resources
                    .into_iter()
                    .map(|resource| (resource.href.clone(), resource))
                    .collect();
            }
            _ => {}
        }
        self.position.advance(event);
        Ok(())
    }

    fn event(&self, version: u64, kind: ResourceEventKind) -> ResourceEvent {
        ResourceEvent {
            metadata: EventMetadata {
                device_id: self.device_id.clone(),
                aggregate_id: self.aggregate_id.clone(),
                version,
                occurred_at: self.clock.now_not_before(self.position.last_timestamp),
            },
            kind,
        }
    }
}

#[async_trait]
impl Model for ResourceLinks {
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        while let Some(event) = iter.next().await? {
            self.apply(&event)?;
        }
        Ok(())
    }
}

impl AggregateModel for ResourceLinks {
    type Command = ResourceLinksCommand;
    type Event = ResourceEvent;

    fn handle_command(
        &self,
        command: &ResourceLinksCommand,
        new_version: u64,
    ) -> Result<Vec<ResourceEvent>, DomainError> {
        if command.device_id() != self.device_id {
            return Err(DomainError::Validation(format!(
                "links of device {} sent to device {}",
                command.device_id(),
                self.device_id
            )));
        }
        match command {
            ResourceLinksCommand::Publish(cmd) => {
                let mut requested = BTreeMap::new();
                for resource in &cmd.resources {
                    if resource.device_id != self.device_id {
                        return Err(DomainError::Validation(format!(
                            "link {} belongs to device {}",
                            resource.href, resource.device_id
                        )));
                    }
                    requested.insert(resource.href.as_str(), resource);
                }
                let changed: Vec<Resource> = requested
                    .into_values()
                    .filter(|resource| self.resources.get(&resource.href) != Some(*resource))
                    .cloned()
                    .collect();
                if changed.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![self.event(
                    new_version,
                    ResourceEventKind::ResourceLinksPublished(ResourceLinksPublished {
                        resources: changed,
                    }),
                )])
            }
            ResourceLinksCommand::Unpublish(cmd) => {
                let mut hrefs: Vec<String> = if cmd.hrefs.is_empty() {
                    self.resources.keys().cloned().collect()
                } else {
                    cmd.hrefs
                        .iter()
                        .filter(|href| self.resources.contains_key(*href))
                        .cloned()
                        .collect()
                };
                hrefs.sort_unstable();
                hrefs.dedup();
                if hrefs.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![self.event(
                    new_version,
                    ResourceEventKind::ResourceLinksUnpublished(ResourceLinksUnpublished {
                        hrefs,
                    }),
                )])
            }
        }
    }

    fn take_snapshot(&self, version: u64) -> Option<ResourceEvent> {
        Some(self.event(
            version,
            ResourceEventKind::ResourceLinksSnapshotTaken(ResourceLinksSnapshotTaken {
                resources: self.resources.values().cloned().collect(),
            }),
        ))
    }

    fn group_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use strata_core::event::{Event, VecIter};
    use strata_test_support::FixedClock;
    use uuid::Uuid;

    use crate::domain::commands::{
        ChangeResourceContent, PublishLinks, PublishResource, UnpublishLinks, UnpublishResource,
    };

    const DEVICE: &str = "device-1";
    const HREF: &str = "/light/1";

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()))
    }

    fn resource(href: &str, types: &[&str]) -> Resource {
        Resource {
            href: href.to_owned(),
            device_id: DEVICE.to_owned(),
            resource_types: types.iter().map(|t| (*t).to_owned()).collect(),
            interfaces: vec!["oic.if.baseline".to_owned()],
        }
    }

    fn publish() -> ResourceStateCommand {
        ResourceStateCommand::Publish(PublishResource {
            correlation_id: Uuid::new_v4(),
            resource: resource(HREF, &["oic.r.switch.binary"]),
        })
    }

    fn change(connection_id: &str, sequence: u64) -> ResourceStateCommand {
        ResourceStateCommand::ChangeContent(ChangeResourceContent {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            href: HREF.to_owned(),
            content: Content {
                content_type: "application/json".to_owned(),
                data: serde_json::json!({ "value": sequence }),
            },
            connection_id: connection_id.to_owned(),
            sequence,
        })
    }

    async fn apply(model: &mut impl Model, events: &[ResourceEvent]) {
        let loaded = events
            .iter()
            .map(|e| LoadedEvent::from_event(e))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        model.handle(&mut VecIter::new(loaded)).await.unwrap();
    }

    #[test]
    fn test_publish_produces_resource_published_event() {
        // Arrange
        let state = ResourceState::new(DEVICE, HREF, clock());

        // Act
        let events = state.handle_command(&publish(), 0).unwrap();

        // Assert
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type(), "resource.published");
        assert_eq!(event.version(), 0);
        assert_eq!(event.group_id(), DEVICE);
        assert_eq!(event.aggregate_id(), resource_aggregate_id(DEVICE, HREF));
    }

    #[tokio::test]
    async fn test_publish_twice_is_rejected() {
        // Arrange
        let mut state = ResourceState::new(DEVICE, HREF, clock());
        let events = state.handle_command(&publish(), 0).unwrap();
        apply(&mut state, &events).await;

        // Act
        let result = state.handle_command(&publish(), 1);

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unpublish_twice_is_rejected() {
        // Arrange
        let mut state = ResourceState::new(DEVICE, HREF, clock());
        let published = state.handle_command(&publish(), 0).unwrap();
        apply(&mut state, &published).await;
        let unpublish = ResourceStateCommand::Unpublish(UnpublishResource {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            href: HREF.to_owned(),
        });
        let unpublished = state.handle_command(&unpublish, 1).unwrap();
        apply(&mut state, &unpublished).await;

        // Act
        let result = state.handle_command(&unpublish, 2);

        // Assert
        match result {
            Err(DomainError::Validation(msg)) => assert!(msg.contains("already unpublished")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_change_on_unpublished_resource_is_rejected() {
        let state = ResourceState::new(DEVICE, HREF, clock());

        let result = state.handle_command(&change("conn-1", 1), 0);

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_stale_change_from_same_connection_is_dropped() {
        // Arrange
        let mut state = ResourceState::new(DEVICE, HREF, clock());
        let published = state.handle_command(&publish(), 0).unwrap();
        apply(&mut state, &published).await;
        let changed = state.handle_command(&change("conn-1", 5), 1).unwrap();
        apply(&mut state, &changed).await;

        // Act
        let stale = state.handle_command(&change("conn-1", 5), 2).unwrap();
        let other_connection = state.handle_command(&change("conn-2", 1), 2).unwrap();

        // Assert
        assert!(stale.is_empty());
        assert_eq!(other_connection.len(), 1);
        assert_eq!(
            state.latest_content().map(|c| c.data.clone()),
            Some(serde_json::json!({ "value": 5 }))
        );
    }

    #[test]
    fn test_command_for_other_resource_is_rejected() {
        let state = ResourceState::new(DEVICE, "/other", clock());

        let result = state.handle_command(&publish(), 0);

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn test_snapshot_restores_state_without_href() {
        // Arrange
        let mut state = ResourceState::new(DEVICE, HREF, clock());
        let published = state.handle_command(&publish(), 0).unwrap();
        apply(&mut state, &published).await;
        let snapshot = state.take_snapshot(1).unwrap();
        let mut restored =
            ResourceState::for_aggregate(DEVICE, &resource_aggregate_id(DEVICE, HREF), clock());

        // Act
        apply(&mut restored, &[snapshot]).await;

        // Assert
        assert_eq!(restored.href(), HREF);
        assert!(restored.is_published());
        assert_eq!(restored.version(), Some(1));
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        // Arrange
        let mut state = ResourceState::new(DEVICE, HREF, clock());
        let mut published = state.handle_command(&publish(), 0).unwrap();
        let later = published[0].metadata.occurred_at + Duration::hours(1);
        published[0].metadata.occurred_at = later;
        apply(&mut state, &published).await;

        // Act
        let changed = state.handle_command(&change("conn-1", 1), 1).unwrap();

        // Assert
        assert_eq!(changed[0].timestamp(), later);
    }

    #[tokio::test]
    async fn test_publish_links_emits_only_new_or_changed_links() {
        // Arrange
        let mut links = ResourceLinks::new(DEVICE, clock());
        let first = ResourceLinksCommand::Publish(PublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            resources: vec![resource("/a", &["x"]), resource("/b", &["y"])],
        });
        let events = links.handle_command(&first, 0).unwrap();
        apply(&mut links, &events).await;
        let second = ResourceLinksCommand::Publish(PublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            resources: vec![
                resource("/a", &["x"]),
                resource("/b", &["z"]),
                resource("/c", &["w"]),
            ],
        });

        // Act
        let events = links.handle_command(&second, 1).unwrap();

        // Assert
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            ResourceEventKind::ResourceLinksPublished(published) => {
                let hrefs: Vec<&str> =
                    published.resources.iter().map(|r| r.href.as_str()).collect();
                assert_eq!(hrefs, vec!["/b", "/c"]);
            }
            other => panic!("expected ResourceLinksPublished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_republishing_identical_links_is_a_no_op() {
        // Arrange
        let mut links = ResourceLinks::new(DEVICE, clock());
        let command = ResourceLinksCommand::Publish(PublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            resources: vec![resource("/a", &["x"])],
        });
        let events = links.handle_command(&command, 0).unwrap();
        apply(&mut links, &events).await;

        // Act
        let again = links.handle_command(&command, 1).unwrap();

        // Assert
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_unpublish_without_hrefs_removes_every_link() {
        // Arrange
        let mut links = ResourceLinks::new(DEVICE, clock());
        let publish = ResourceLinksCommand::Publish(PublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            resources: vec![resource("/b", &["x"]), resource("/a", &["y"])],
        });
        let events = links.handle_command(&publish, 0).unwrap();
        apply(&mut links, &events).await;
        let unpublish_all = ResourceLinksCommand::Unpublish(UnpublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            hrefs: Vec::new(),
        });

        // Act
        let events = links.handle_command(&unpublish_all, 1).unwrap();
        apply(&mut links, &events).await;
        let nothing_left = links.handle_command(&unpublish_all, 2).unwrap();

        // Assert
        match &events[0].kind {
            ResourceEventKind::ResourceLinksUnpublished(unpublished) => {
                assert_eq!(unpublished.hrefs, vec!["/a".to_owned(), "/b".to_owned()]);
            }
            other => panic!("expected ResourceLinksUnpublished, got {other:?}"),
        }
        assert_eq!(links.resources().count(), 0);
        assert!(nothing_left.is_empty());
    }

    #[test]
    fn test_links_of_foreign_device_are_rejected() {
        let links = ResourceLinks::new(DEVICE, clock());
        let mut foreign = resource("/a", &["x"]);
        foreign.device_id = "device-2".to_owned();
        let command = ResourceLinksCommand::Publish(PublishLinks {
            correlation_id: Uuid::new_v4(),
            device_id: DEVICE.to_owned(),
            resources: vec![foreign],
        });

        let result = links.handle_command(&command, 0);

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }
}
