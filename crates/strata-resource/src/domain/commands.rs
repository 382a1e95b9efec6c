//! Commands for the device resource context.

use strata_core::command::Command;
use uuid::Uuid;

use super::events::{Content, Resource};

/// Command to publish a resource.
#[derive(Debug, Clone)]
pub struct PublishResource {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The resource being published.
    pub resource: Resource,
}

/// Command to unpublish a resource.
#[derive(Debug, Clone)]
pub struct UnpublishResource {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Device exposing the resource.
    pub device_id: String,
    /// Path of the resource.
    pub href: String,
}

/// Command to record new content reported by a device.
#[derive(Debug, Clone)]
pub struct ChangeResourceContent {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Device exposing the resource.
    pub device_id: String,
    /// Path of the resource.
    pub href: String,
    /// The reported content.
    pub content: Content,
    /// Connection the report arrived on.
    pub connection_id: String,
    /// Sequence number of the report within its connection.
    pub sequence: u64,
}

/// Commands accepted by a resource aggregate.
#[derive(Debug, Clone)]
pub enum ResourceStateCommand {
    /// Publish the resource.
    Publish(PublishResource),
    /// Unpublish the resource.
    Unpublish(UnpublishResource),
    /// Record new content.
    ChangeContent(ChangeResourceContent),
}

impl ResourceStateCommand {
    /// Device the command targets.
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Publish(cmd) => &cmd.resource.device_id,
            Self::Unpublish(cmd) => &cmd.device_id,
            Self::ChangeContent(cmd) => &cmd.device_id,
        }
    }

    /// Resource path the command targets.
    #[must_use]
    pub fn href(&self) -> &str {
        match self {
            Self::Publish(cmd) => &cmd.resource.href,
            Self::Unpublish(cmd) => &cmd.href,
            Self::ChangeContent(cmd) => &cmd.href,
        }
    }
}

impl Command for ResourceStateCommand {
    fn command_type(&self) -> &'static str {
        match self {
            Self::Publish(_) => "resource.publish",
            Self::Unpublish(_) => "resource.unpublish",
            Self::ChangeContent(_) => "resource.change_content",
        }
    }

    fn correlation_id(&self) -> Uuid {
        match self {
            Self::Publish(cmd) => cmd.correlation_id,
            Self::Unpublish(cmd) => cmd.correlation_id,
            Self::ChangeContent(cmd) => cmd.correlation_id,
        }
    }
}

/// Command to publish links; links already published unchanged are skipped.
#[derive(Debug, Clone)]
pub struct PublishLinks {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Device owning the links.
    pub device_id: String,
    /// Links to publish.
    pub resources: Vec<Resource>,
}

/// Command to unpublish links.
#[derive(Debug, Clone)]
pub struct UnpublishLinks {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Device owning the links.
    pub device_id: String,
    /// Paths to unpublish; empty means every published link.
    pub hrefs: Vec<String>,
}

/// Commands accepted by a resource links aggregate.
#[derive(Debug, Clone)]
pub enum ResourceLinksCommand {
    /// Publish links.
    Publish(PublishLinks),
    /// Unpublish links.
    Unpublish(UnpublishLinks),
}

impl ResourceLinksCommand {
    /// Device the command targets.
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Publish(cmd) => &cmd.device_id,
            Self::Unpublish(cmd) => &cmd.device_id,
        }
    }
}

impl Command for ResourceLinksCommand {
    fn command_type(&self) -> &'static str {
        match self {
            Self::Publish(_) => "resource_links.publish",
            Self::Unpublish(_) => "resource_links.unpublish",
        }
    }

    fn correlation_id(&self) -> Uuid {
        match self {
            Self::Publish(cmd) => cmd.correlation_id,
            Self::Unpublish(cmd) => cmd.correlation_id,
        }
    }
}
