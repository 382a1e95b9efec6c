//! Domain error types.

use thiserror::Error;

/// Top-level domain error type shared by stores, models and projections.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A batch of events was rejected before any I/O took place.
    #[error("invalid events: {0}")]
    InvalidEvents(String),

    /// A load, remove or delete query was malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A validation error in domain logic (e.g. a command the model rejects).
    #[error("validation error: {0}")]
    Validation(String),

    /// A persisted payload could not be decoded into the requested type.
    #[error("cannot decode event {event_type} (version {version}): {source}")]
    Decode {
        /// Type discriminator of the event being decoded.
        event_type: String,
        /// Version of the event being decoded.
        version: u64,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// A payload could not be encoded for persistence.
    #[error("cannot encode event {event_type}: {source}")]
    Encode {
        /// Type discriminator of the event being encoded.
        event_type: String,
        /// Underlying serialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// The operation was cancelled by the caller before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` when the error was raised by caller-side validation
    /// rather than by the backend.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidEvents(_) | Self::InvalidQuery(_) | Self::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_events_display() {
        let err = DomainError::InvalidEvents("empty batch".into());
        assert_eq!(err.to_string(), "invalid events: empty batch");
        assert!(err.is_validation());
    }

    #[test]
    fn test_infrastructure_is_not_validation() {
        let err = DomainError::Infrastructure("connection refused".into());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_decode_display_names_event() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = DomainError::Decode {
            event_type: "resourcepublished".into(),
            version: 3,
            source,
        };
        assert!(
            err.to_string()
                .starts_with("cannot decode event resourcepublished (version 3)")
        );
    }
}
