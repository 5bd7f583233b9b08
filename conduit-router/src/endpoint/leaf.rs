//! Behaviour shared by every leaf kind

use conduit_types::{FaultHandlerRef, Message};
use std::borrow::Cow;
use tracing::{debug, info, warn};

use super::Endpoint;
use crate::definition::EndpointDefinition;
use crate::error::Result;
use crate::fault;
use crate::tree::EndpointTree;

/// Property naming the last leaf a message was handed to
pub const LAST_ENDPOINT_PROPERTY: &str = "last_endpoint";

/// A leaf wraps one [`EndpointDefinition`] and talks to the transport
#[derive(Debug, Clone)]
pub struct LeafEndpoint {
    definition: EndpointDefinition,
}

impl LeafEndpoint {
    pub fn new(definition: EndpointDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &EndpointDefinition {
        &self.definition
    }

    pub(crate) fn send(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        destination: Cow<'_, EndpointDefinition>,
        mut message: Message,
    ) -> Result<()> {
        debug!(
            endpoint = %endpoint,
            address = ?destination.address(),
            message_id = %message.id(),
            "Sending message"
        );
        message.set_property(LAST_ENDPOINT_PROPERTY, endpoint.to_string());
        message.push_fault_handler(FaultHandlerRef::Endpoint(endpoint.id()));
        tree.context().transport().send(&destination, message);
        Ok(())
    }

    /// Classify the transport's error, update liveness and pass the
    /// failure on
    pub(crate) fn on_fault(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        let code = message.error_code();
        let now = tree.now();

        let transition = match code {
            Some(code) if self.definition.is_timeout_code(code) => {
                Some(endpoint.liveness().on_timeout(now))
            }
            Some(code) if self.definition.is_suspend_code(code) => {
                Some(endpoint.liveness().suspend(now))
            }
            None if self.definition.suspend_error_codes().is_empty() => {
                Some(endpoint.liveness().suspend(now))
            }
            _ => None,
        };

        match transition {
            Some(Ok(snapshot)) => info!(
                endpoint = %endpoint,
                error_code = ?code,
                state = ?snapshot.state,
                recover_at = ?snapshot.recover_at,
                consecutive_failures = snapshot.consecutive_failures,
                "Endpoint taken out of rotation"
            ),
            Some(Err(e)) => warn!(
                endpoint = %endpoint,
                error_code = ?code,
                error = %e,
                "Endpoint suspended locally but replication failed"
            ),
            None => debug!(
                endpoint = %endpoint,
                error_code = ?code,
                "Non-fatal error, endpoint stays active"
            ),
        }

        fault::invoke_next_fault_handler(tree, Some(endpoint.id()), message)
    }
}
