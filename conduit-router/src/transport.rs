//! Transport boundary
//!
//! The router never performs I/O. Leaves hand messages to a [`Transport`];
//! failures come back later through `EndpointTree::handle_fault`.

use conduit_types::Message;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::error;

use crate::definition::EndpointDefinition;

/// Fire-and-forget delivery to a physical destination
pub trait Transport: Send + Sync + Debug {
    /// Start delivering `message` to `definition`'s address.
    ///
    /// Must not block on I/O. The message still carries its fault stack; a
    /// transport that fails sets a fault on it and passes it to
    /// `EndpointTree::handle_fault`.
    fn send(&self, definition: &EndpointDefinition, message: Message);
}

/// A message handed to a [`ChannelTransport`]
#[derive(Debug)]
pub struct Delivery {
    pub definition: EndpointDefinition,
    pub message: Message,
}

impl Delivery {
    pub fn address(&self) -> Option<&str> {
        self.definition.address()
    }
}

/// Transport that queues deliveries on a tokio channel for an I/O task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, definition: &EndpointDefinition, message: Message) {
        let delivery = Delivery {
            definition: definition.clone(),
            message,
        };
        if let Err(e) = self.sender.send(delivery) {
            error!(
                address = ?e.0.definition.address(),
                message_id = %e.0.message.id(),
                "Transport channel closed, dropping message"
            );
        }
    }
}
