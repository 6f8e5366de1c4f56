use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identifier of a connected client process.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ClientNodeId(pub u64);

impl ClientNodeId {
    /// Node id carried by requests the server issues to itself (promotion, self-messages).
    pub const NULL: ClientNodeId = ClientNodeId(u64::MAX);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for ClientNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("server")
        } else {
            write!(f, "client-{}", self.0)
        }
    }
}
