//! Liveness tracking for routing nodes
//!
//! Every node owns a [`LivenessState`]. Leaves suspend themselves on fatal
//! errors and recover lazily once their suspension elapses; composites are
//! suspended when no child is ready and reactivated by the next readiness check.

mod cluster;
mod state;

pub use cluster::{ClusterError, ClusterState, InMemoryClusterState, SharedValue};
pub use state::{EndpointState, LivenessSnapshot, LivenessState, SuspendPolicy};
