use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition tag assigned to an invocation by the entity's concurrency strategy.
///
/// Invocations sharing a key retire in registration order. [`ConcurrencyKey::UNIVERSAL`]
/// opts out of key ordering entirely; [`ConcurrencyKey::MANAGEMENT`] is the lane lifecycle
/// requests are scheduled on.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConcurrencyKey(pub i32);

impl ConcurrencyKey {
    pub const UNIVERSAL: ConcurrencyKey = ConcurrencyKey(i32::MIN);
    pub const MANAGEMENT: ConcurrencyKey = ConcurrencyKey(0);

    pub fn new(key: i32) -> Self {
        Self(key)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn is_universal(&self) -> bool {
        *self == Self::UNIVERSAL
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            f.write_str("universal")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
