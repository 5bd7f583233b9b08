//! Load balancing algorithms
//!
//! An algorithm only chooses among the children it is given; liveness is
//! supplied by the caller through `is_active` so algorithms never touch the
//! tree directly.

mod random;
mod round_robin;
mod weighted;

pub use random::RandomSelection;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use conduit_types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Child selection strategy shared by load-balance and session-affinity nodes
pub trait LoadBalanceAlgorithm: Send + Sync + Debug {
    /// Pick the next active child, or `None` if no child is active.
    ///
    /// Must never index past `children` even when called concurrently.
    fn next(&self, children: &[NodeId], is_active: &mut dyn FnMut(NodeId) -> bool)
        -> Option<NodeId>;

    fn name(&self) -> &'static str;
}

/// Declarative algorithm selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    RoundRobin,

    /// Weights line up with the node's children; missing weights count as 1
    WeightedRoundRobin { weights: Vec<u32> },

    Random,
}

impl AlgorithmKind {
    pub fn build(&self) -> Arc<dyn LoadBalanceAlgorithm> {
        match self {
            AlgorithmKind::RoundRobin => Arc::new(RoundRobin::new()),
            AlgorithmKind::WeightedRoundRobin { weights } => {
                Arc::new(WeightedRoundRobin::new(weights.clone()))
            }
            AlgorithmKind::Random => Arc::new(RandomSelection),
        }
    }
}
