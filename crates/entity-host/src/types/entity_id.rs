use super::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one entity: its type plus an instance name unique within that type.
///
/// Stable for the entity's whole lifetime, across destroy and re-create.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: EntityType,
    pub name: String,
}

impl EntityId {
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::new(entity_type),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.name)
    }
}
