//! Recipient-list endpoint

use conduit_types::{codes, FaultHandlerRef, Message, MessageSequence, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::Endpoint;
use crate::error::Result;
use crate::fault;
use crate::pool::DynamicEndpointPool;
use crate::tree::EndpointTree;

/// Where a recipient list without children finds its recipients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSource {
    /// Fixed comma separated addresses
    Literal(String),

    /// Comma separated addresses read from a message property
    Property(String),
}

impl RecipientSource {
    pub fn addresses(&self, message: &Message) -> Vec<String> {
        match self {
            RecipientSource::Literal(list) => split_recipients(list),
            RecipientSource::Property(key) => message
                .property(key)
                .and_then(|value| value.as_str())
                .map(split_recipients)
                .unwrap_or_default(),
        }
    }
}

/// Split a comma separated address list, skipping blank entries
pub fn split_recipients(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

/// Address of the message's destination moved onto `member`: the member
/// keeps its scheme, host and port, the message supplies path and query
fn member_address(member: &Url, to: Option<&str>) -> String {
    let Some(to) = to.and_then(|to| Url::parse(to).ok()) else {
        return member.to_string();
    };
    let mut address = member.clone();
    address.set_path(to.path());
    address.set_query(to.query());
    address.to_string()
}

/// Sends an independent copy of each message to every ready recipient
#[derive(Debug)]
pub struct RecipientListEndpoint {
    children: Vec<NodeId>,
    members: Vec<Url>,
    recipients: Option<RecipientSource>,
    pool: DynamicEndpointPool,
}

impl RecipientListEndpoint {
    pub fn new(
        children: Vec<NodeId>,
        members: Vec<Url>,
        recipients: Option<RecipientSource>,
        pool_size: usize,
    ) -> Self {
        Self {
            children,
            members,
            recipients,
            pool: DynamicEndpointPool::new(pool_size),
        }
    }

    pub fn with_children(children: Vec<NodeId>, pool_size: usize) -> Self {
        Self::new(children, Vec::new(), None, pool_size)
    }

    pub fn with_members(members: Vec<Url>, pool_size: usize) -> Self {
        Self::new(Vec::new(), members, None, pool_size)
    }

    pub fn with_recipients(recipients: RecipientSource, pool_size: usize) -> Self {
        Self::new(Vec::new(), Vec::new(), Some(recipients), pool_size)
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn members(&self) -> &[Url] {
        &self.members
    }

    pub fn recipients(&self) -> Option<&RecipientSource> {
        self.recipients.as_ref()
    }

    pub fn pool(&self) -> &DynamicEndpointPool {
        &self.pool
    }

    pub(crate) fn has_targets(&self) -> bool {
        !self.children.is_empty() || !self.members.is_empty() || self.recipients.is_some()
    }

    /// Recipients of `message`; configured children that no longer exist
    /// are skipped
    fn targets(
        &self,
        tree: &EndpointTree,
        owner: NodeId,
        message: &Message,
        evicted: &mut Vec<NodeId>,
    ) -> Result<Vec<Arc<Endpoint>>> {
        if !self.children.is_empty() {
            return Ok(self.children.iter().filter_map(|id| tree.get(*id)).collect());
        }
        let addresses: Vec<String> = if !self.members.is_empty() {
            self.members
                .iter()
                .map(|member| member_address(member, message.to()))
                .collect()
        } else if let Some(source) = &self.recipients {
            source.addresses(message)
        } else {
            Vec::new()
        };

        addresses
            .iter()
            .map(|address| self.pool.resolve(tree, owner, address, evicted))
            .collect()
    }

    pub(crate) fn send(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        let mut evicted = Vec::new();
        let result = self.fan_out(tree, endpoint, message, &mut evicted);
        // evicted leaves may have been targets of this message
        for id in evicted {
            tree.remove(id);
        }
        result
    }

    fn fan_out(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        mut message: Message,
        evicted: &mut Vec<NodeId>,
    ) -> Result<()> {
        let ready: Vec<Arc<Endpoint>> = self
            .targets(tree, endpoint.id(), &message, evicted)?
            .into_iter()
            .filter(|target| target.ready_to_send(tree))
            .collect();

        if ready.is_empty() {
            warn!(endpoint = %endpoint, message_id = %message.id(), "No ready recipients");
            return fault::inform_failure(
                tree,
                endpoint.id(),
                message,
                codes::RL_NONE_READY,
                "Recipient list has no ready recipient",
            );
        }

        message.build_payload();
        let total = ready.len();
        debug!(endpoint = %endpoint, recipients = total, message_id = %message.id(), "Fanning out message");

        let mut first_error = None;
        for (index, target) in ready.iter().enumerate() {
            let mut copy = message.fork();
            copy.set_sequence(MessageSequence { index, total });
            copy.push_fault_handler(FaultHandlerRef::Endpoint(endpoint.id()));
            if let Err(e) = target.send(tree, copy) {
                warn!(endpoint = %endpoint, recipient = %target, error = %e, "Recipient dispatch failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn on_child_endpoint_fail(
        &self,
        tree: &EndpointTree,
        endpoint: &Endpoint,
        child: Option<NodeId>,
        message: Message,
    ) -> Result<()> {
        warn!(
            endpoint = %endpoint,
            recipient = ?child,
            message_id = %message.id(),
            sequence = ?message.sequence().map(|s| s.to_string()),
            error_code = ?message.error_code(),
            "Recipient failed"
        );
        fault::inform_failure(
            tree,
            endpoint.id(),
            message,
            codes::RL_NONE_READY,
            "One of the recipients failed",
        )
    }

    /// Any configured child ready; member and dynamic lists are always ready
    pub(crate) fn ready_to_send(&self, tree: &EndpointTree) -> bool {
        if self.children.is_empty() {
            return true;
        }
        self.children.iter().any(|child| tree.ready_to_send(*child))
    }

    pub(crate) fn destroy(&self, tree: &EndpointTree) {
        self.pool.clear(tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_recipients() {
        assert_eq!(
            split_recipients(" http://a , ,http://b,"),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
        assert!(split_recipients(" , ").is_empty());
    }

    #[test]
    fn test_property_source() {
        let message = Message::new("").with_property("targets", "http://a,http://b");
        let source = RecipientSource::Property("targets".to_string());
        assert_eq!(source.addresses(&message).len(), 2);
        assert!(source.addresses(&Message::new("")).is_empty());
    }

    #[test]
    fn test_member_address_rewrite() {
        let member = Url::parse("http://10.0.0.5:9000/").unwrap();
        assert_eq!(
            member_address(&member, Some("http://service.local/orders/1?expand=true")),
            "http://10.0.0.5:9000/orders/1?expand=true"
        );
        assert_eq!(member_address(&member, None), "http://10.0.0.5:9000/");
    }
}
