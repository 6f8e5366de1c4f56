use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-side handle number distinguishing several bindings of one client to one entity.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ClientInstanceId(pub u64);

impl fmt::Display for ClientInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
