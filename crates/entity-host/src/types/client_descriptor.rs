use super::{ClientNodeId, EntityDescriptor, EntityId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Addressable identity of one connected client's binding to an entity.
///
/// Handed to entity instances on `connected` / `disconnected` and with every invocation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub node_id: ClientNodeId,
    pub entity_descriptor: EntityDescriptor,
}

impl ClientDescriptor {
    pub fn new(node_id: ClientNodeId, entity_descriptor: EntityDescriptor) -> Self {
        Self {
            node_id,
            entity_descriptor,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_descriptor.entity_id
    }
}

impl fmt::Display for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.entity_descriptor)
    }
}
