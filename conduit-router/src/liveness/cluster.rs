//! Cluster-wide liveness sharing.
//!
//! The router only depends on the key/value contract below; how values reach
//! other processes is up to the implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Value stored in the shared cluster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedValue {
    Bool(bool),
    Millis(u64),
    Text(String),
}

impl SharedValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SharedValue::Bool(value) => Some(*value),
            SharedValue::Text(text) => text.trim().parse().ok(),
            SharedValue::Millis(_) => None,
        }
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            SharedValue::Millis(value) => Some(*value),
            SharedValue::Text(text) => text.trim().parse().ok(),
            SharedValue::Bool(_) => None,
        }
    }
}

/// Cluster state errors
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Replication of {keys:?} failed: {reason}")]
    Replication { keys: Vec<String>, reason: String },

    #[error("Cluster state unavailable: {0}")]
    Unavailable(String),
}

/// Key/value state shared by every process of a cluster
pub trait ClusterState: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<SharedValue>;

    fn set(&self, key: &str, value: SharedValue);

    fn remove(&self, key: &str);

    /// Push the current values of `keys` to the other members
    fn replicate(&self, keys: &[String]) -> Result<(), ClusterError>;
}

/// Process-local [`ClusterState`].
///
/// Several trees holding the same instance behave like cluster members that
/// replicate instantly.
#[derive(Debug, Default)]
pub struct InMemoryClusterState {
    values: RwLock<HashMap<String, SharedValue>>,
    replications: AtomicU64,
    fail_replication: AtomicBool,
}

impl InMemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `replicate` calls
    pub fn replication_count(&self) -> u64 {
        self.replications.load(Ordering::Relaxed)
    }

    /// Make every following `replicate` call fail
    pub fn set_replication_failing(&self, failing: bool) {
        self.fail_replication.store(failing, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl ClusterState for InMemoryClusterState {
    fn get(&self, key: &str) -> Option<SharedValue> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: SharedValue) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }

    fn replicate(&self, keys: &[String]) -> Result<(), ClusterError> {
        if self.fail_replication.load(Ordering::Relaxed) {
            return Err(ClusterError::Replication {
                keys: keys.to_vec(),
                reason: "replication disabled".to_string(),
            });
        }
        self.replications.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
