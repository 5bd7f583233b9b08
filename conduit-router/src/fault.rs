//! Fault propagation
//!
//! A message remembers who wants to hear about its failure: every node that
//! delegates a message pushes itself onto the message's fault stack first.
//! When delivery fails the stack is unwound one entry at a time:
//!
//! ```text
//!   fault stack (top first)        on failure
//!   ─────────────────────────      ──────────────────────────────────────
//!   Endpoint(leaf)            ──►  classify error, update liveness
//!   Endpoint(load balance)    ──►  fail over to a sibling, or pass on
//!   Endpoint(session)         ──►  rebind first message, or pass on
//!   Terminal(handler)         ──►  structured fault for the producer
//! ```
//!
//! An empty stack means nobody owns the failure; that is reported as
//! [`RouteError::UnhandledFault`] instead of being dropped.

use conduit_types::{FaultHandlerRef, Message, MessageFault, NodeId};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{Result, RouteError};
use crate::tree::EndpointTree;

/// Hand `message` to the next handler on its fault stack.
///
/// `failed` is the node reporting the failure; an endpoint handler receives
/// it as the failed child. Handlers of endpoints that no longer exist are
/// skipped.
pub(crate) fn invoke_next_fault_handler(
    tree: &EndpointTree,
    failed: Option<NodeId>,
    mut message: Message,
) -> Result<()> {
    loop {
        match message.pop_fault_handler() {
            Some(FaultHandlerRef::Endpoint(id)) => {
                if tree.get(id).is_some() {
                    return tree.on_child_endpoint_fail(id, failed, message);
                }
                warn!(endpoint_id = %id, message_id = %message.id(), "Skipping fault handler of removed endpoint");
            }
            Some(FaultHandlerRef::Terminal(handler)) => {
                debug!(
                    handler = handler.name(),
                    message_id = %message.id(),
                    error_code = ?message.error_code(),
                    "Delivering fault to terminal handler"
                );
                handler.handle_fault(message);
                return Ok(());
            }
            None => return unhandled(&message),
        }
    }
}

/// Report a failure of `node` upwards, recording `code` unless the message
/// already carries a fault
pub(crate) fn inform_failure(
    tree: &EndpointTree,
    node: NodeId,
    mut message: Message,
    code: i32,
    text: &str,
) -> Result<()> {
    if message.fault().is_none() {
        message.set_fault(MessageFault::new(code, text));
    }
    invoke_next_fault_handler(tree, Some(node), message)
}

/// Count one failover of `message` at `node`; false once `limit` is reached
pub(crate) fn take_failover_attempt(message: &mut Message, node: NodeId, limit: usize) -> bool {
    let key = format!("failover_attempts:{}", node.0);
    let attempts = message
        .property(&key)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if attempts >= limit as u64 {
        return false;
    }
    message.set_property(key, attempts + 1);
    true
}

pub(crate) fn unhandled(message: &Message) -> Result<()> {
    error!(
        message_id = %message.id(),
        error_code = ?message.error_code(),
        "Failed message has no fault handler left"
    );
    Err(RouteError::UnhandledFault {
        message_id: message.id(),
    })
}
