//! Indirect endpoint: a key resolved through the endpoint registry on every
//! operation

use conduit_types::{Message, NodeId};
use tracing::error;

use crate::error::{Result, RouteError};
use crate::tree::EndpointTree;

#[derive(Debug, Clone)]
pub struct IndirectEndpoint {
    key: String,
}

impl IndirectEndpoint {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn resolve(&self, tree: &EndpointTree) -> Result<NodeId> {
        match tree.context().registry().resolve(&self.key) {
            Some(target) if tree.get(target).is_some() => Ok(target),
            _ => {
                error!(key = %self.key, "Indirect endpoint reference does not resolve");
                Err(RouteError::UnresolvedReference {
                    key: self.key.clone(),
                })
            }
        }
    }

    pub(crate) fn send(&self, tree: &EndpointTree, message: Message) -> Result<()> {
        let target = self.resolve(tree)?;
        tree.send(target, message)
    }
}
