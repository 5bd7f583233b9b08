//! Routing node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a routing node in an endpoint tree arena.
///
/// The low 32 bits are the arena slot, the high 32 bits the generation of
/// that slot. Freed slots are reused with a bumped generation, so a stale id
/// left on a message's fault stack resolves to nothing instead of to an
/// unrelated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(index: u32, generation: u32) -> Self {
        NodeId((u64::from(generation) << 32) | u64::from(index))
    }

    /// Arena slot of this node
    pub fn index(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation() {
            0 => write!(f, "#{}", self.index()),
            generation => write!(f, "#{}.{}", self.index(), generation),
        }
    }
}
