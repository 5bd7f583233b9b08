//! Routing nodes
//!
//! Every node of an [`EndpointTree`] is an [`Endpoint`]: identity, parent
//! link and liveness common to all nodes, plus an [`EndpointKind`] holding
//! the variant specific routing state.

mod indirect;
mod leaf;
mod load_balance;
mod recipient_list;
mod session_affinity;
mod template;

pub use indirect::IndirectEndpoint;
pub use leaf::{LeafEndpoint, LAST_ENDPOINT_PROPERTY};
pub use load_balance::LoadBalanceEndpoint;
pub use recipient_list::{split_recipients, RecipientListEndpoint, RecipientSource};
pub use session_affinity::SessionAffinityEndpoint;
pub use template::TemplateEndpoint;

use conduit_types::{Message, NodeId};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::definition::EndpointDefinition;
use crate::error::{Result, RouteError};
use crate::fault;
use crate::liveness::{EndpointState, LivenessState};
use crate::tree::EndpointTree;

/// Variant specific part of a routing node
#[derive(Debug)]
pub enum EndpointKind {
    /// Fixed address
    Address(LeafEndpoint),

    /// Service port resolved from a WSDL description
    Wsdl(LeafEndpoint),

    /// Whatever address the message itself is sent to
    Default(LeafEndpoint),

    Template(TemplateEndpoint),

    Indirect(IndirectEndpoint),

    LoadBalance(LoadBalanceEndpoint),

    SessionAffinity(SessionAffinityEndpoint),

    RecipientList(RecipientListEndpoint),
}

impl EndpointKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EndpointKind::Address(_) => "address",
            EndpointKind::Wsdl(_) => "wsdl",
            EndpointKind::Default(_) => "default",
            EndpointKind::Template(_) => "template",
            EndpointKind::Indirect(_) => "indirect",
            EndpointKind::LoadBalance(_) => "load_balance",
            EndpointKind::SessionAffinity(_) => "session_affinity",
            EndpointKind::RecipientList(_) => "recipient_list",
        }
    }

    pub fn leaf(&self) -> Option<&LeafEndpoint> {
        match self {
            EndpointKind::Address(leaf) | EndpointKind::Wsdl(leaf) | EndpointKind::Default(leaf) => {
                Some(leaf)
            }
            _ => None,
        }
    }

    /// Children owned by this node
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            EndpointKind::LoadBalance(lb) => lb.children().to_vec(),
            EndpointKind::SessionAffinity(sa) => sa.children().to_vec(),
            EndpointKind::RecipientList(rl) => rl.children().to_vec(),
            EndpointKind::Template(template) => template.target().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            EndpointKind::Address(leaf) if leaf.definition().address().is_none() => Err(
                RouteError::InvalidTopology("address endpoint needs an address".to_string()),
            ),
            EndpointKind::Wsdl(leaf) if leaf.definition().service().is_none() => Err(
                RouteError::InvalidTopology("wsdl endpoint needs a service descriptor".to_string()),
            ),
            EndpointKind::RecipientList(rl) if !rl.has_targets() => {
                Err(RouteError::InvalidTopology(
                    "recipient list needs children, members or a recipient source".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A node of the routing tree
#[derive(Debug)]
pub struct Endpoint {
    id: NodeId,
    name: Option<String>,
    parent: RwLock<Option<NodeId>>,
    kind: EndpointKind,
    liveness: LivenessState,
    initialized: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(
        id: NodeId,
        name: Option<String>,
        kind: EndpointKind,
        liveness: LivenessState,
    ) -> Self {
        Self {
            id,
            name,
            parent: RwLock::new(None),
            kind,
            liveness,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn liveness(&self) -> &LivenessState {
        &self.liveness
    }

    pub fn parent(&self) -> Option<NodeId> {
        *self.parent.read()
    }

    pub(crate) fn set_parent(&self, parent: Option<NodeId>) {
        *self.parent.write() = parent;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.leaf().is_some()
    }

    /// Leaf policy, `None` for every other kind
    pub fn definition(&self) -> Option<&EndpointDefinition> {
        self.kind.leaf().map(LeafEndpoint::definition)
    }

    pub(crate) fn send(&self, tree: &EndpointTree, message: Message) -> Result<()> {
        match &self.kind {
            EndpointKind::Address(leaf) | EndpointKind::Wsdl(leaf) => {
                leaf.send(tree, self, Cow::Borrowed(leaf.definition()), message)
            }
            EndpointKind::Default(leaf) => {
                let Some(to) = message.to() else {
                    warn!(endpoint = %self, message_id = %message.id(), "Message has no destination");
                    return Err(RouteError::MissingDestination {
                        message_id: message.id(),
                    });
                };
                let destination = leaf.definition().redirect(to);
                leaf.send(tree, self, Cow::Owned(destination), message)
            }
            EndpointKind::Template(template) => template.send(tree, self, message),
            EndpointKind::Indirect(indirect) => indirect.send(tree, message),
            EndpointKind::LoadBalance(lb) => lb.send(tree, self, message),
            EndpointKind::SessionAffinity(sa) => sa.send(tree, self, message),
            EndpointKind::RecipientList(rl) => rl.send(tree, self, message),
        }
    }

    /// Failure reported by the transport for a message this node handed out
    pub(crate) fn on_fault(&self, tree: &EndpointTree, message: Message) -> Result<()> {
        match self.kind.leaf() {
            Some(leaf) => leaf.on_fault(tree, self, message),
            None => self.on_child_endpoint_fail(tree, None, message),
        }
    }

    pub(crate) fn on_child_endpoint_fail(
        &self,
        tree: &EndpointTree,
        child: Option<NodeId>,
        message: Message,
    ) -> Result<()> {
        match &self.kind {
            EndpointKind::LoadBalance(lb) => lb.on_child_endpoint_fail(tree, self, child, message),
            EndpointKind::SessionAffinity(sa) => {
                sa.on_child_endpoint_fail(tree, self, child, message)
            }
            EndpointKind::RecipientList(rl) => {
                rl.on_child_endpoint_fail(tree, self, child, message)
            }
            _ => fault::invoke_next_fault_handler(tree, Some(self.id), message),
        }
    }

    pub(crate) fn is_active(&self, tree: &EndpointTree) -> bool {
        match &self.kind {
            EndpointKind::Address(_) | EndpointKind::Wsdl(_) | EndpointKind::Default(_) => {
                self.liveness.is_active(tree.now())
            }
            EndpointKind::Template(template) => template
                .target()
                .map_or(false, |target| tree.is_active(target)),
            EndpointKind::Indirect(indirect) => indirect
                .resolve(tree)
                .map_or(false, |target| tree.is_active(target)),
            EndpointKind::LoadBalance(lb) => self.check_children(tree, lb.children()),
            EndpointKind::SessionAffinity(sa) => self.check_children(tree, sa.children()),
            EndpointKind::RecipientList(rl) => {
                self.liveness.state() != EndpointState::Off && rl.ready_to_send(tree)
            }
        }
    }

    /// A composite is active while it is, or once any child is. Every child
    /// is checked so that each gets a chance to recover.
    fn check_children(&self, tree: &EndpointTree, children: &[NodeId]) -> bool {
        if self.liveness.is_active(tree.now()) {
            return true;
        }
        if self.liveness.state() == EndpointState::Off {
            return false;
        }

        let mut any_active = false;
        for child in children {
            any_active |= tree.is_active(*child);
        }
        if any_active {
            if let Err(e) = self.liveness.mark_active() {
                warn!(endpoint = %self, error = %e, "Failed to replicate reactivation");
            }
            debug!(endpoint = %self, "Reactivated after probing children");
        }
        any_active
    }

    pub(crate) fn set_active(&self, tree: &EndpointTree, active: bool) -> Result<()> {
        match &self.kind {
            EndpointKind::Template(template) => {
                let target = template.resolve(self)?;
                tree.set_active(target, active)
            }
            EndpointKind::Indirect(indirect) => {
                let target = indirect.resolve(tree)?;
                tree.set_active(target, active)
            }
            _ => {
                let snapshot = if active {
                    self.liveness.mark_active()?
                } else {
                    self.liveness.suspend(tree.now())?
                };
                info!(endpoint = %self, state = ?snapshot.state, recover_at = ?snapshot.recover_at, "Liveness changed");
                Ok(())
            }
        }
    }

    pub(crate) fn ready_to_send(&self, tree: &EndpointTree) -> bool {
        match &self.kind {
            EndpointKind::Address(_) | EndpointKind::Wsdl(_) | EndpointKind::Default(_) => {
                self.liveness.state() != EndpointState::Off
                    && (!self.is_initialized() || self.liveness.is_active(tree.now()))
            }
            EndpointKind::Template(template) => template
                .target()
                .map_or(false, |target| tree.ready_to_send(target)),
            EndpointKind::Indirect(indirect) => indirect
                .resolve(tree)
                .map_or(false, |target| tree.ready_to_send(target)),
            EndpointKind::LoadBalance(lb) => self.any_child_ready(tree, lb.children()),
            EndpointKind::SessionAffinity(sa) => self.any_child_ready(tree, sa.children()),
            EndpointKind::RecipientList(rl) => {
                self.liveness.state() != EndpointState::Off && rl.ready_to_send(tree)
            }
        }
    }

    fn any_child_ready(&self, tree: &EndpointTree, children: &[NodeId]) -> bool {
        self.liveness.state() != EndpointState::Off
            && children.iter().any(|child| tree.ready_to_send(*child))
    }

    /// Take this node out of rotation after it failed to route a message
    pub(crate) fn suspend_after_failure(&self, tree: &EndpointTree) {
        match self.liveness.suspend(tree.now()) {
            Ok(snapshot) => info!(
                endpoint = %self,
                recover_at = ?snapshot.recover_at,
                "Endpoint suspended"
            ),
            Err(e) => warn!(endpoint = %self, error = %e, "Endpoint suspended locally but replication failed"),
        }
    }

    pub(crate) fn init(&self, tree: &EndpointTree) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        if let EndpointKind::Template(template) = &self.kind {
            template.init(tree, self)?;
        }

        let replicate = self
            .definition()
            .map_or(false, EndpointDefinition::replicate_state);
        if let (true, Some(cluster)) = (replicate, tree.context().cluster()) {
            match &self.name {
                Some(name) => self.liveness.attach_cluster(cluster.clone(), name),
                None => warn!(
                    endpoint = %self,
                    "Anonymous endpoint keeps its liveness local in a clustered router"
                ),
            }
        }

        self.initialized.store(true, Ordering::Release);
        debug!(endpoint = %self, kind = self.kind.type_name(), "Initialized endpoint");
        Ok(())
    }

    pub(crate) fn destroy(&self, tree: &EndpointTree) {
        match &self.kind {
            EndpointKind::RecipientList(rl) => rl.destroy(tree),
            EndpointKind::SessionAffinity(sa) => sa.sessions().clear(),
            _ => {}
        }
        self.liveness.detach_cluster();
        self.initialized.store(false, Ordering::Release);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Endpoint [{name}]"),
            None => write!(f, "anonymous endpoint {}", self.id),
        }
    }
}
