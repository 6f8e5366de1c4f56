use super::{ClientInstanceId, EntityId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One client's binding to one entity instance at a given entity version.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_id: EntityId,
    pub client_instance_id: ClientInstanceId,
    pub version: u64,
}

impl EntityDescriptor {
    pub fn new(entity_id: EntityId, client_instance_id: ClientInstanceId, version: u64) -> Self {
        Self {
            entity_id,
            client_instance_id,
            version,
        }
    }
}

impl fmt::Display for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@v{}",
            self.entity_id, self.client_instance_id, self.version
        )
    }
}
