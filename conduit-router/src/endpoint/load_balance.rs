//! Load-balance endpoint

use conduit_types::{codes, FaultHandlerRef, Message, NodeId};
use std::sync::Arc;
use tracing::{debug, warn};

use super::Endpoint;
use crate::algorithm::LoadBalanceAlgorithm;
use crate::error::Result;
use crate::fault;
use crate::tree::EndpointTree;

/// Spreads messages over its children with a [`LoadBalanceAlgorithm`].
///
/// With failover, a failed delivery is retried on the next active child; a
/// message fails over at most once per child.
#[derive(Debug)]
pub struct LoadBalanceEndpoint {
    algorithm: Arc<dyn LoadBalanceAlgorithm>,
    failover: bool,
    children: Vec<NodeId>,
}

impl LoadBalanceEndpoint {
    pub fn new(
        algorithm: Arc<dyn LoadBalanceAlgorithm>,
        failover: bool,
        children: Vec<NodeId>,
    ) -> Self {
        Self {
            algorithm,
            failover,
            children,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn failover(&self) -> bool {
        self.failover
    }

    pub fn algorithm(&self) -> &Arc<dyn LoadBalanceAlgorithm> {
        &self.algorithm
    }

    pub(crate) fn send(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        mut message: Message,
    ) -> Result<()> {
        let next = self
            .algorithm
            .next(&self.children, &mut |child| tree.is_active(child));

        let Some(child) = next else {
            warn!(endpoint = %endpoint, children = self.children.len(), "No active child endpoint");
            endpoint.suspend_after_failure(tree);
            return fault::inform_failure(
                tree,
                endpoint.id(),
                message,
                codes::LB_NONE_READY,
                "Load balance endpoint has no active child",
            );
        };

        if self.failover {
            message.build_payload();
        }
        debug!(
            endpoint = %endpoint,
            child = %child,
            algorithm = self.algorithm.name(),
            message_id = %message.id(),
            "Selected child endpoint"
        );
        message.push_fault_handler(FaultHandlerRef::Endpoint(endpoint.id()));
        tree.send(child, message)
    }

    pub(crate) fn on_child_endpoint_fail(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        child: Option<NodeId>,
        mut message: Message,
    ) -> Result<()> {
        if !self.failover {
            // only this delivery failed; siblings may still be active
            return fault::invoke_next_fault_handler(tree, Some(endpoint.id()), message);
        }

        if fault::take_failover_attempt(&mut message, endpoint.id(), self.children.len()) {
            debug!(
                endpoint = %endpoint,
                failed_child = ?child,
                message_id = %message.id(),
                "Failing over to another child"
            );
            return tree.send(endpoint.id(), message);
        }

        warn!(endpoint = %endpoint, message_id = %message.id(), "Failover attempts exhausted");
        fault::inform_failure(
            tree,
            endpoint.id(),
            message,
            codes::LB_NONE_READY,
            "Load balance endpoint exhausted its failover attempts",
        )
    }
}
