//! Query handlers for the device resource context.
//!
//! [`ResourceDirectory`] keeps a projection of every loaded device and serves
//! read-only views from it; devices are loaded lazily on first query.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use strata_core::clock::Clock;
use strata_core::error::DomainError;
use strata_core::event::{EventIter, Model};
use strata_core::projection::Projection;
use strata_core::store::{EventStore, SnapshotQuery};
use tracing::debug;

use crate::domain::aggregates::{ResourceLinks, ResourceState};
use crate::domain::events::{Content, Resource, links_aggregate_id, resource_aggregate_id};

/// Read-only view of one device resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceView {
    /// Device exposing the resource.
    pub device_id: String,
    /// Path of the resource.
    pub href: String,
    /// The resource as last published.
    pub resource: Option<Resource>,
    /// Whether the resource is currently published.
    pub is_published: bool,
    /// Latest reported content.
    pub content: Option<Content>,
    /// Version of the last applied event.
    pub version: u64,
}

/// Read-only view of the links a device publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceLinksView {
    /// Device owning the links.
    pub device_id: String,
    /// Published links ordered by href.
    pub resources: Vec<Resource>,
    /// Version of the last applied event.
    pub version: u64,
}

/// Model of any aggregate in a device group.
pub enum DeviceModel {
    /// A single resource.
    Resource(ResourceState),
    /// The device's links.
    Links(ResourceLinks),
}

#[async_trait]
impl Model for DeviceModel {
    async fn handle(&mut self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        match self {
            Self::Resource(state) => state.handle(iter).await,
            Self::Links(links) => links.handle(iter).await,
        }
    }
}

/// Projection-backed read side for device resources.
pub struct ResourceDirectory {
    projection: Projection<DeviceModel>,
}

impl ResourceDirectory {
    /// Creates an empty directory reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        let projection = Projection::new(store, move |device_id: &str, aggregate_id: &str| {
            let clock = Arc::clone(&clock);
            if aggregate_id == links_aggregate_id(device_id) {
                Ok(DeviceModel::Links(ResourceLinks::new(device_id, clock)))
            } else {
                Ok(DeviceModel::Resource(ResourceState::for_aggregate(
                    device_id,
                    aggregate_id,
                    clock,
                )))
            }
        });
        Self { projection }
    }

    /// Loads or catches up every aggregate of `device_id` from the store.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store or a model fails.
    pub async fn refresh_device(&self, device_id: &str) -> Result<(), DomainError> {
        debug!(device_id, "refreshing device");
        self.projection.project(&[SnapshotQuery::group(device_id)]).await
    }

    /// Applies a stream of freshly published events, reloading any aggregate
    /// whose versions arrive with a gap.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store or a model fails.
    pub async fn apply_events(&self, iter: &mut dyn EventIter) -> Result<(), DomainError> {
        self.projection.handle_with_reload(iter).await
    }

    /// Drops every cached aggregate of `device_id`.
    pub async fn forget_device(&self, device_id: &str) {
        self.projection.forget(&[SnapshotQuery::group(device_id)]).await;
    }

    async fn view<T, F>(
        &self,
        query: SnapshotQuery,
        mut to_view: F,
    ) -> Result<Option<T>, DomainError>
    where
        F: FnMut(&DeviceModel) -> Option<T>,
    {
        let queries = [query];
        let mut found = None;
        self.projection
            .models(&queries, |model| {
                found = to_view(model);
                false
            })
            .await;
        if found.is_some() {
            return Ok(found);
        }
        self.projection.project(&queries).await?;
        self.projection
            .models(&queries, |model| {
                found = to_view(model);
                false
            })
            .await;
        Ok(found)
    }

    /// Returns the resource at `href` on `device_id`, or `None` if it was
    /// never published.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if loading the resource fails.
    pub async fn get_resource(
        &self,
        device_id: &str,
        href: &str,
    ) -> Result<Option<ResourceView>, DomainError> {
        let query = SnapshotQuery::aggregate(device_id, resource_aggregate_id(device_id, href));
        self.view(query, |model| match model {
            DeviceModel::Resource(state) => state.version().map(|version| ResourceView {
                device_id: state.device_id().to_owned(),
                href: state.href().to_owned(),
                resource: state.resource().cloned(),
                is_published: state.is_published(),
                content: state.latest_content().cloned(),
                version,
            }),
            DeviceModel::Links(_) => None,
        })
        .await
    }

    /// Returns the links published by `device_id`, or `None` if the device
    /// never published any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if loading the links fails.
    pub async fn get_device_links(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceLinksView>, DomainError> {
        let query = SnapshotQuery::aggregate(device_id, links_aggregate_id(device_id));
        self.view(query, |model| match model {
            DeviceModel::Links(links) => links.version().map(|version| DeviceLinksView {
                device_id: links.device_id().to_owned(),
                resources: links.resources().cloned().collect(),
                version,
            }),
            DeviceModel::Resource(_) => None,
        })
        .await
    }

    /// Number of aggregates currently cached.
    pub async fn cached_aggregates(&self) -> usize {
        self.projection.len().await
    }
}
