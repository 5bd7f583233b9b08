//! Pool of leaves created for dynamically computed recipients

use conduit_types::NodeId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::tree::EndpointTree;

/// Bounded address → leaf cache.
///
/// Resolving an address reuses its leaf while it is pooled, so the leaf's
/// suspension history survives between messages. Once the pool is full the
/// least recently used leaf is evicted. Eviction only hands the leaf back to
/// the caller: a message may still be fanning out to it, so the caller
/// removes it from the tree after dispatching.
///
/// The pool lock is held across the whole resolve, including arena updates;
/// the arena never calls back into a pool.
#[derive(Debug)]
pub struct DynamicEndpointPool {
    entries: Mutex<LruCache<String, NodeId>>,
}

impl DynamicEndpointPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Leaf for `address`, creating it under `owner` if it is not pooled.
    ///
    /// The leaf is returned rather than its id: once the pool lock is
    /// released another sender may evict and remove it. Leaves pushed out of
    /// the pool are appended to `evicted`.
    pub fn resolve(
        &self,
        tree: &EndpointTree,
        owner: NodeId,
        address: &str,
        evicted: &mut Vec<NodeId>,
    ) -> Result<Arc<Endpoint>> {
        let mut entries = self.entries.lock();
        if let Some(id) = entries.get(address).copied() {
            if let Some(endpoint) = tree.get(id) {
                return Ok(endpoint);
            }
            entries.pop(address);
        }

        let id = tree.insert_dynamic_leaf(owner, address)?;
        let endpoint = tree.endpoint(id)?;
        debug!(address = %address, endpoint = %id, pooled = entries.len(), "Created dynamic endpoint");

        if let Some((evicted_address, evicted_id)) = entries.push(address.to_string(), id) {
            if evicted_id != id {
                debug!(address = %evicted_address, endpoint = %evicted_id, "Evicting dynamic endpoint");
                evicted.push(evicted_id);
            }
        }
        Ok(endpoint)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.lock().contains(address)
    }

    /// Pooled addresses, most recently used first
    pub fn addresses(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Remove every pooled leaf from the tree
    pub fn clear(&self, tree: &EndpointTree) {
        let mut entries = self.entries.lock();
        while let Some((_, id)) = entries.pop_lru() {
            tree.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
