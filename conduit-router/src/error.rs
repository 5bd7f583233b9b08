//! Router error types

use conduit_types::NodeId;
use thiserror::Error;

use crate::liveness::ClusterError;

/// Errors returned by routing operations.
///
/// Delivery failures never show up here: they travel on the message's fault
/// stack. These are configuration and integration errors that abort the
/// current operation.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Endpoint reference '{key}' does not resolve to a registered endpoint")]
    UnresolvedReference { key: String },

    #[error("Unknown endpoint template: {0}")]
    UnknownTemplate(String),

    #[error("Unknown endpoint: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Endpoint not initialized: {0}")]
    NotInitialized(String),

    #[error("Fault for message {message_id} reached an empty fault stack")]
    UnhandledFault { message_id: uuid::Uuid },

    #[error("Message {message_id} has no destination address")]
    MissingDestination { message_id: uuid::Uuid },

    #[error("Invalid blueprint: {0}")]
    InvalidBlueprint(String),

    #[error("Cluster state error: {0}")]
    Cluster(#[from] ClusterError),
}

pub type Result<T> = std::result::Result<T, RouteError>;
