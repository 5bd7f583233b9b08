//! Conduit shared types
//!
//! Transport-neutral message model consumed by the routing tree:
//!
//! - [`Message`]: payload, headers, property bag and the per-message fault stack
//! - [`NodeId`]: opaque handle of a routing node inside an endpoint tree
//! - [`FaultHandler`]: terminal receiver of failed deliveries
//! - [`codes`]: error codes carried by [`MessageFault`]

pub mod codes;
pub mod message;
pub mod node;

pub use message::{
    FaultHandler, FaultHandlerRef, Message, MessageFault, MessageSequence, Payload, SequenceError,
};
pub use node::NodeId;
