mod client_descriptor;
mod client_instance_id;
mod client_node_id;
mod concurrency_key;
mod entity_descriptor;
mod entity_id;
mod entity_type;
mod message_id;

pub use client_descriptor::ClientDescriptor;
pub use client_instance_id::ClientInstanceId;
pub use client_node_id::ClientNodeId;
pub use concurrency_key::ConcurrencyKey;
pub use entity_descriptor::EntityDescriptor;
pub use entity_id::EntityId;
pub use entity_type::EntityType;
pub use message_id::{MessageId, MessageIdGenerator};
