//! Name lookups used by indirect and template endpoints

use conduit_types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::blueprint::TemplateDefinition;

/// Registered endpoints by key.
///
/// Indirect endpoints resolve their key on every operation, so re-registering
/// a key redirects traffic without rebuilding the tree.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, NodeId>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `key`, returning the endpoint it replaces
    pub fn register(&self, key: impl Into<String>, endpoint: NodeId) -> Option<NodeId> {
        let key = key.into();
        info!(key = %key, endpoint = %endpoint, "Registering endpoint");
        self.endpoints.write().insert(key, endpoint)
    }

    pub fn unregister(&self, key: &str) -> Option<NodeId> {
        let removed = self.endpoints.write().remove(key);
        if removed.is_some() {
            info!(key = %key, "Unregistered endpoint");
        }
        removed
    }

    pub fn resolve(&self, key: &str) -> Option<NodeId> {
        self.endpoints.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

/// Endpoint templates by name
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, TemplateDefinition>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: TemplateDefinition) {
        info!(template = %template.name, parameters = ?template.parameters, "Registering template");
        self.templates.write().insert(template.name.clone(), template);
    }

    pub fn resolve(&self, name: &str) -> Option<TemplateDefinition> {
        self.templates.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}
