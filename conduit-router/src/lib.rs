//! Conduit Router - Endpoint Routing and Failover
//!
//! Decides which destination receives a message, hands it to the transport
//! and recovers when delivery fails.
//!
//! # Architecture
//!
//! ```text
//!                     Message
//!                        │ send
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │                 EndpointTree                 │
//! │                                              │
//! │   LoadBalance / SessionAffinity / Recipient  │  composites pick children
//! │        │               │              │      │
//! │        ▼               ▼              ▼      │
//! │   Address / Wsdl / Default leaves            │  leaves call the transport
//! └────────────────────────┬─────────────────────┘
//!                          │ Transport::send
//!                          ▼
//!                    (I/O elsewhere)
//!                          │ failure
//!                          ▼
//!            EndpointTree::handle_fault ──► fault stack unwind
//! ```
//!
//! Each node pushes itself onto the message's fault stack before delegating.
//! A failed delivery comes back through [`EndpointTree::handle_fault`]: the
//! leaf classifies the error and updates its liveness, then each composite
//! above it either recovers (fail over, rebind a new session) or passes the
//! failure on, until a terminal [`FaultHandler`] receives it.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_router::{ChannelTransport, EndpointBlueprint, EndpointTree, RouterConfig, RouterContext};
//!
//! let (transport, deliveries) = ChannelTransport::new();
//! let context = RouterContext::new(RouterConfig::from_env(), Arc::new(transport));
//! let tree = EndpointTree::new(context);
//!
//! let root = tree.build(&EndpointBlueprint::from_json(json)?)?;
//! tree.init()?;
//! tree.send(root, message)?;
//! ```

// Core modules
mod clock;
mod config;
mod context;
mod definition;
mod error;
mod fault;
mod logging;
mod registry;
mod transport;
mod tree;

// Routing building blocks
pub mod algorithm;
pub mod endpoint;
pub mod liveness;
pub mod session;

mod blueprint;
mod pool;

#[cfg(test)]
mod tests;

// Re-exports: Errors and configuration
pub use config::{DefaultSuspend, RouterConfig};
pub use error::{Result, RouteError};
pub use logging::init_logging;

// Re-exports: Tree and context
pub use blueprint::{EndpointBlueprint, TemplateDefinition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RouterContext;
pub use definition::{EndpointDefinition, EndpointDefinitionBuilder, ServiceDescriptor, TimeoutAction};
pub use pool::DynamicEndpointPool;
pub use registry::{EndpointRegistry, TemplateCatalog};
pub use transport::{ChannelTransport, Delivery, Transport};
pub use tree::EndpointTree;

// Re-exports: Endpoints
pub use endpoint::{Endpoint, EndpointKind, RecipientSource};
pub use liveness::{ClusterState, EndpointState, InMemoryClusterState, LivenessSnapshot};

// Re-exports: Message model
pub use conduit_types::{
    codes, FaultHandler, FaultHandlerRef, Message, MessageFault, MessageSequence, NodeId, Payload,
};
