use crate::types::{EntityId, EntityType};

/// Client-facing failures of entity requests.
///
/// Every variant is reported through a request's completion sink. Corruption of the
/// retirement graph or lifecycle state is not represented here; those paths panic.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("entity {entity_id} already exists")]
    AlreadyExists { entity_id: EntityId },

    #[error("entity {entity_id} not found")]
    NotFound { entity_id: EntityId },

    #[error("entity {entity_id} is at version {expected}, request used version {actual}")]
    VersionMismatch {
        entity_id: EntityId,
        expected: u64,
        actual: u64,
    },

    #[error("no entity service registered for type {entity_type}")]
    UnknownEntityType { entity_type: EntityType },

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invocation failed: {reason}")]
    InvocationFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("request processor is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl EntityError {
    /// Wrap a codec failure.
    pub fn malformed(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Business-logic failure raised by an entity implementation.
    pub fn invocation(reason: impl Into<String>) -> Self {
        Self::InvocationFailed {
            reason: reason.into(),
            source: None,
        }
    }
}
