//! Message model
//!
//! A [`Message`] is the unit routed through an endpoint tree. Besides its
//! payload it carries everything the tree needs to recover from a failed
//! delivery:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │           Message            │
//! ├──────────────────────────────┤
//! │ payload      (stream/built)  │
//! │ headers      (transport)     │
//! │ properties   (mediation)     │
//! │ fault        (last error)    │
//! │ fault_stack  (LIFO handlers) │ ← pushed by each node before delegating
//! │ sequence     (fan-out tag)   │
//! │ endpoint_path (sessions)     │
//! └──────────────────────────────┘
//! ```
//!
//! Cloning is a deep copy: fan-out deliveries never share a property bag or
//! a fault stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::node::NodeId;

/// Terminal receiver of a failed delivery.
///
/// Installed at the bottom of a message's fault stack by whatever produced
/// the message; it turns the failure into a structured fault for the caller.
pub trait FaultHandler: Send + Sync {
    /// Take ownership of a message whose delivery failed
    fn handle_fault(&self, message: Message);

    /// Name used in logs
    fn name(&self) -> &str {
        "fault-handler"
    }
}

/// Entry on a message's fault stack.
#[derive(Clone)]
pub enum FaultHandlerRef {
    /// A routing node that delegated the message and wants to hear about failures
    Endpoint(NodeId),

    /// A terminal handler owned by the message producer
    Terminal(Arc<dyn FaultHandler>),
}

impl fmt::Debug for FaultHandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultHandlerRef::Endpoint(id) => f.debug_tuple("Endpoint").field(id).finish(),
            FaultHandlerRef::Terminal(handler) => {
                f.debug_tuple("Terminal").field(&handler.name()).finish()
            }
        }
    }
}

/// Structured failure attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFault {
    /// Numeric error code (see [`codes`](crate::codes))
    pub code: i32,

    /// Human readable message
    pub message: String,

    /// Optional detail, e.g. the transport's own description
    pub detail: Option<String>,
}

impl MessageFault {
    /// Create a fault without detail
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a detail string
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Position of a fan-out copy among its siblings, used by response aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSequence {
    /// Zero-based index of this copy
    pub index: usize,

    /// Number of copies dispatched
    pub total: usize,
}

impl fmt::Display for MessageSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Errors parsing a [`MessageSequence`] from its `index/total` form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Missing '/' delimiter in sequence: {0}")]
    MissingDelimiter(String),

    #[error("Invalid number in sequence: {0}")]
    InvalidNumber(String),

    #[error("Index {index} out of range for total {total}")]
    OutOfRange { index: usize, total: usize },
}

impl FromStr for MessageSequence {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, total) = s
            .split_once('/')
            .ok_or_else(|| SequenceError::MissingDelimiter(s.to_string()))?;
        let index: usize = index
            .trim()
            .parse()
            .map_err(|_| SequenceError::InvalidNumber(index.to_string()))?;
        let total: usize = total
            .trim()
            .parse()
            .map_err(|_| SequenceError::InvalidNumber(total.to_string()))?;
        if index >= total {
            return Err(SequenceError::OutOfRange { index, total });
        }
        Ok(Self { index, total })
    }
}

/// Message body.
///
/// A streaming body can be consumed only once by the transport; anything that
/// may replay the message (failover, fan-out) must build it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Body still arriving as chunks from the inbound transport
    Streaming(Vec<Vec<u8>>),

    /// Fully materialized body
    Built(Vec<u8>),
}

impl Payload {
    /// Whether the payload can be replayed
    pub fn is_built(&self) -> bool {
        matches!(self, Payload::Built(_))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Built(Vec::new())
    }
}

/// A message in flight through the routing tree.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    to: Option<String>,
    response: bool,
    headers: HashMap<String, String>,
    properties: HashMap<String, Value>,
    payload: Payload,
    fault: Option<MessageFault>,
    fault_stack: Vec<FaultHandlerRef>,
    sequence: Option<MessageSequence>,
    endpoint_path: Vec<NodeId>,
}

impl Message {
    /// Create a request with a fully built body
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(Payload::Built(body.into()))
    }

    /// Create a request whose body is still streaming
    pub fn streaming(chunks: Vec<Vec<u8>>) -> Self {
        Self::with_payload(Payload::Streaming(chunks))
    }

    /// Create a response message
    pub fn new_response(body: impl Into<Vec<u8>>) -> Self {
        let mut message = Self::new(body);
        message.response = true;
        message
    }

    fn with_payload(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            to: None,
            response: false,
            headers: HashMap::new(),
            properties: HashMap::new(),
            payload,
            fault: None,
            fault_stack: Vec::new(),
            sequence: None,
            endpoint_path: Vec::new(),
        }
    }

    /// Deep copy with a fresh message id, used for fan-out
    pub fn fork(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_response(&self) -> bool {
        self.response
    }

    /// Logical destination requested by the producer
    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn set_to(&mut self, to: impl Into<String>) {
        self.to = Some(to.into());
    }

    /// Builder-style variant of [`Message::set_to`]
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.set_to(to);
        self
    }

    /// Transport header lookup (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`Message::set_header`]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Builder-style variant of [`Message::set_property`]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Materialize a streaming payload so the message can be sent more than once
    pub fn build_payload(&mut self) {
        if let Payload::Streaming(chunks) = &mut self.payload {
            let body = std::mem::take(chunks).concat();
            self.payload = Payload::Built(body);
        }
    }

    pub fn fault(&self) -> Option<&MessageFault> {
        self.fault.as_ref()
    }

    /// Error code of the last recorded fault
    pub fn error_code(&self) -> Option<i32> {
        self.fault.as_ref().map(|fault| fault.code)
    }

    pub fn set_fault(&mut self, fault: MessageFault) {
        self.fault = Some(fault);
    }

    pub fn clear_fault(&mut self) -> Option<MessageFault> {
        self.fault.take()
    }

    /// Register a handler to be consulted if delivery fails
    pub fn push_fault_handler(&mut self, handler: FaultHandlerRef) {
        self.fault_stack.push(handler);
    }

    /// Take the next responsible handler
    pub fn pop_fault_handler(&mut self) -> Option<FaultHandlerRef> {
        self.fault_stack.pop()
    }

    pub fn fault_stack(&self) -> &[FaultHandlerRef] {
        &self.fault_stack
    }

    pub fn sequence(&self) -> Option<MessageSequence> {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: MessageSequence) {
        self.sequence = Some(sequence);
    }

    /// Nodes traversed by a server-initiated session that is not bound yet
    pub fn endpoint_path(&self) -> &[NodeId] {
        &self.endpoint_path
    }

    pub fn endpoint_path_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.endpoint_path
    }
}
