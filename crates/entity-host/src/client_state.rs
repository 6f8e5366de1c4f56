use crate::types::{ClientNodeId, EntityDescriptor};
use dashmap::DashMap;
use std::collections::HashSet;

/// Tracks which entity references each client node currently holds.
pub trait ClientEntityStateManager: Send + Sync {
    /// Record that `node` fetched the entity. Returns false if the reference was
    /// already held.
    fn add_reference(&self, node: ClientNodeId, descriptor: EntityDescriptor) -> bool;

    /// Drop a reference. Returns false if `node` did not hold it.
    fn remove_reference(&self, node: ClientNodeId, descriptor: &EntityDescriptor) -> bool;

    fn references_for(&self, node: ClientNodeId) -> Vec<EntityDescriptor>;
}

/// In-memory [`ClientEntityStateManager`].
#[derive(Debug, Default)]
pub struct ClientEntityStateTracker {
    references: DashMap<ClientNodeId, HashSet<EntityDescriptor>>,
}

impl ClientEntityStateTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientEntityStateManager for ClientEntityStateTracker {
    fn add_reference(&self, node: ClientNodeId, descriptor: EntityDescriptor) -> bool {
        self.references.entry(node).or_default().insert(descriptor)
    }

    fn remove_reference(&self, node: ClientNodeId, descriptor: &EntityDescriptor) -> bool {
        let removed = match self.references.get_mut(&node) {
            Some(mut held) => held.remove(descriptor),
            None => return false,
        };
        self.references.remove_if(&node, |_, held| held.is_empty());
        removed
    }

    fn references_for(&self, node: ClientNodeId) -> Vec<EntityDescriptor> {
        self.references
            .get(&node)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default()
    }
}
