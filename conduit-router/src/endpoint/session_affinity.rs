//! Session-affinity load-balance endpoint
//!
//! The first message of a session picks a child through the algorithm and
//! may fail over like a load balancer. Once the session is bound every
//! message goes to the same child, and failures are surfaced rather than
//! retried elsewhere.
//!
//! Client-initiated sessions bind as soon as the child is picked.
//! Server-initiated sessions only learn their key from the response, so the
//! first message records the nodes it traversed on
//! [`Message::endpoint_path`] and [`EndpointTree::update_session`] binds them
//! once the response arrives.

use conduit_types::{codes, FaultHandlerRef, Message, NodeId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Endpoint;
use crate::algorithm::LoadBalanceAlgorithm;
use crate::error::Result;
use crate::fault;
use crate::session::{DispatchTable, SessionDispatcher};
use crate::tree::EndpointTree;

fn first_message_key(id: NodeId) -> String {
    format!("first_message_in_session:{}", id.0)
}

/// Load balancer that pins each session to one child
#[derive(Debug)]
pub struct SessionAffinityEndpoint {
    algorithm: Arc<dyn LoadBalanceAlgorithm>,
    dispatcher: Arc<dyn SessionDispatcher>,
    sessions: DispatchTable,
    children: Vec<NodeId>,
}

impl SessionAffinityEndpoint {
    pub fn new(
        algorithm: Arc<dyn LoadBalanceAlgorithm>,
        dispatcher: Arc<dyn SessionDispatcher>,
        children: Vec<NodeId>,
        capacity: usize,
        session_timeout: Option<Duration>,
    ) -> Self {
        Self {
            algorithm,
            dispatcher,
            sessions: DispatchTable::new(capacity, session_timeout),
            children,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn dispatcher(&self) -> &Arc<dyn SessionDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &DispatchTable {
        &self.sessions
    }

    /// Whether `message` is the first of its session at this endpoint
    pub fn is_first_message(&self, endpoint: &Endpoint, message: &Message) -> bool {
        message
            .property(&first_message_key(endpoint.id()))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn send(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        mut message: Message,
    ) -> Result<()> {
        let now = tree.now();
        let key = self.dispatcher.session_key(&message);
        let bound = key
            .as_deref()
            .and_then(|key| self.sessions.lookup(key, now));

        let target = match bound {
            Some(child) => Some(child),
            None => {
                let picked = self
                    .algorithm
                    .next(&self.children, &mut |child| tree.is_active(child));
                if let Some(child) = picked {
                    self.start_session(tree, endpoint, key.as_deref(), child, &mut message, now);
                }
                picked
            }
        };

        match target {
            Some(child) if tree.is_active(child) => {
                debug!(
                    endpoint = %endpoint,
                    child = %child,
                    session = ?key,
                    bound = bound.is_some(),
                    "Dispatching session message"
                );
                message.push_fault_handler(FaultHandlerRef::Endpoint(endpoint.id()));
                tree.send(child, message)
            }
            Some(child) => {
                warn!(endpoint = %endpoint, child = %child, session = ?key, "Session endpoint is not active");
                fault::inform_failure(
                    tree,
                    endpoint.id(),
                    message,
                    codes::SAL_NOT_READY,
                    "Endpoint bound to the session is not active",
                )
            }
            None => {
                warn!(endpoint = %endpoint, children = self.children.len(), "No active child endpoint");
                endpoint.suspend_after_failure(tree);
                fault::inform_failure(
                    tree,
                    endpoint.id(),
                    message,
                    codes::SAL_NOT_READY,
                    "Session affinity endpoint has no active child",
                )
            }
        }
    }

    fn start_session(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        key: Option<&str>,
        child: NodeId,
        message: &mut Message,
        now: u64,
    ) {
        if self.dispatcher.is_server_initiated() {
            let path = message.endpoint_path_mut();
            path.push(endpoint.id());
            // a nested session endpoint records itself
            if !tree.is_session_affinity(child) {
                path.push(child);
            }
        } else if let Some(key) = key {
            self.sessions.bind(key, child, now);
            info!(endpoint = %endpoint, session = %key, child = %child, "Bound session");
        }

        // failover stays possible until the session is established
        message.build_payload();
        message.set_property(first_message_key(endpoint.id()), true);
    }

    pub(crate) fn on_child_endpoint_fail(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        child: Option<NodeId>,
        mut message: Message,
    ) -> Result<()> {
        let first = self.is_first_message(endpoint, &message);
        if first && fault::take_failover_attempt(&mut message, endpoint.id(), self.children.len())
        {
            if let Some(key) = self.dispatcher.session_key(&message) {
                self.sessions.unbind(&key);
            }
            let path = message.endpoint_path_mut();
            if let Some(position) = path.iter().position(|id| *id == endpoint.id()) {
                path.truncate(position);
            }
            message.remove_property(&first_message_key(endpoint.id()));

            debug!(
                endpoint = %endpoint,
                failed_child = ?child,
                message_id = %message.id(),
                "First message of session failed, rebinding"
            );
            return tree.send(endpoint.id(), message);
        }

        warn!(
            endpoint = %endpoint,
            failed_child = ?child,
            message_id = %message.id(),
            "Session endpoint failed, not failing over"
        );
        fault::inform_failure(
            tree,
            endpoint.id(),
            message,
            codes::SAL_NOT_READY,
            "Endpoint bound to the session failed",
        )
    }

    /// Bind the session announced by `response` to the child after this
    /// endpoint on `path`
    pub(crate) fn update_session(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        response: &Message,
        path: &[NodeId],
    ) -> Result<()> {
        let Some(child) = path.first().copied() else {
            return Ok(());
        };
        let Some(key) = self.dispatcher.response_session_key(response) else {
            debug!(endpoint = %endpoint, "Response carries no session key");
            return Ok(());
        };

        self.sessions.bind(&key, child, tree.now());
        info!(endpoint = %endpoint, session = %key, child = %child, "Bound session from response");

        if tree.is_session_affinity(child) {
            tree.update_session(response, path)
        } else {
            Ok(())
        }
    }
}
