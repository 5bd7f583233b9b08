//! Session binding table

use conduit_types::NodeId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;

/// A session pinned to one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    pub endpoint: NodeId,
    pub created_at: u64,
    pub last_access: u64,
}

/// Bounded session → child table.
///
/// Least recently used sessions are dropped once `capacity` is reached.
/// With a timeout, a binding idle for longer than the timeout is dropped on
/// the next lookup; every hit refreshes `last_access`.
#[derive(Debug)]
pub struct DispatchTable {
    sessions: Mutex<LruCache<String, SessionBinding>>,
    timeout: Option<Duration>,
}

impl DispatchTable {
    pub fn new(capacity: usize, timeout: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            timeout,
        }
    }

    /// Bound child for `key`, refreshing the binding
    pub fn lookup(&self, key: &str, now: u64) -> Option<NodeId> {
        let mut sessions = self.sessions.lock();
        let binding = sessions.get_mut(key)?;
        if !self.is_expired(binding, now) {
            binding.last_access = now;
            return Some(binding.endpoint);
        }
        sessions.pop(key);
        None
    }

    /// Bind `key` to `endpoint`, replacing any earlier binding
    pub fn bind(&self, key: &str, endpoint: NodeId, now: u64) {
        self.sessions.lock().push(
            key.to_string(),
            SessionBinding {
                endpoint,
                created_at: now,
                last_access: now,
            },
        );
    }

    pub fn unbind(&self, key: &str) -> Option<SessionBinding> {
        self.sessions.lock().pop(key)
    }

    /// Binding for `key` without touching recency or expiry
    pub fn get(&self, key: &str) -> Option<SessionBinding> {
        self.sessions.lock().peek(key).copied()
    }

    /// Drop every expired binding, returning how many were removed
    pub fn clear_expired(&self, now: u64) -> usize {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, binding)| self.is_expired(binding, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            sessions.pop(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, binding: &SessionBinding, now: u64) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_sub(binding.last_access) > timeout.as_millis() as u64,
            None => false,
        }
    }
}
