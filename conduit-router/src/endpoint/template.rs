//! Template endpoint: instantiated from the template catalog at init and
//! transparent afterwards

use conduit_types::{Message, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{error, info};

use super::Endpoint;
use crate::error::{Result, RouteError};
use crate::tree::EndpointTree;

#[derive(Debug)]
pub struct TemplateEndpoint {
    template: String,
    parameters: HashMap<String, String>,
    target: RwLock<Option<NodeId>>,
}

impl TemplateEndpoint {
    pub fn new(template: impl Into<String>, parameters: HashMap<String, String>) -> Self {
        Self {
            template: template.into(),
            parameters,
            target: RwLock::new(None),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Root of the instantiated subtree, once initialized
    pub fn target(&self) -> Option<NodeId> {
        *self.target.read()
    }

    /// Build the subtree. The endpoint's own name is available to the
    /// template as `$name` unless given explicitly.
    pub(crate) fn init(&self, tree: &EndpointTree, endpoint: &Endpoint) -> Result<()> {
        let mut target = self.target.write();
        if target.is_some() {
            return Ok(());
        }

        let Some(definition) = tree.context().templates().resolve(&self.template) else {
            error!(endpoint = %endpoint, template = %self.template, "Unknown endpoint template");
            return Err(RouteError::UnknownTemplate(self.template.clone()));
        };

        let mut parameters = self.parameters.clone();
        if let Some(name) = endpoint.name() {
            parameters
                .entry("name".to_string())
                .or_insert_with(|| name.to_string());
        }

        let blueprint = definition.instantiate(&parameters)?;
        let root = tree.build(&blueprint)?;
        tree.set_parent(root, Some(endpoint.id()))?;
        *target = Some(root);

        info!(endpoint = %endpoint, template = %self.template, root = %root, "Instantiated template");
        Ok(())
    }

    pub(crate) fn resolve(&self, endpoint: &Endpoint) -> Result<NodeId> {
        self.target()
            .ok_or_else(|| RouteError::NotInitialized(endpoint.to_string()))
    }

    pub(crate) fn send(&self, tree: &EndpointTree, endpoint: &Endpoint, message: Message) -> Result<()> {
        let target = self.resolve(endpoint)?;
        tree.send(target, message)
    }
}
