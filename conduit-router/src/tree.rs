//! Endpoint tree
//!
//! Nodes live in an arena indexed by [`NodeId`]. Parents own their children
//! through id lists and children point back with a plain id, so the tree has
//! no reference cycles. A removed node frees its slot for the next insert;
//! the slot's generation is bumped first, so stale ids stop resolving
//! instead of reaching the new occupant.
//!
//! The arena lock is only held long enough to clone an `Arc<Endpoint>`;
//! routing decisions run without it. Session tables and dynamic pools may
//! take the arena lock while holding their own, never the reverse.

use conduit_types::{FaultHandlerRef, Message, NodeId};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::algorithm::AlgorithmKind;
use crate::blueprint::EndpointBlueprint;
use crate::context::RouterContext;
use crate::definition::EndpointDefinition;
use crate::endpoint::{
    Endpoint, EndpointKind, IndirectEndpoint, LeafEndpoint, LoadBalanceEndpoint,
    RecipientListEndpoint, SessionAffinityEndpoint, TemplateEndpoint,
};
use crate::error::{Result, RouteError};
use crate::fault;
use crate::liveness::{LivenessSnapshot, LivenessState, SuspendPolicy};

#[derive(Debug)]
struct Slot {
    generation: u32,
    endpoint: Option<Arc<Endpoint>>,
}

/// Generational slots plus a free list of vacated ones
#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn get(&self, id: NodeId) -> Option<&Arc<Endpoint>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.endpoint.as_ref())
    }

    /// Id the next [`Arena::occupy`] will use
    fn next_id(&self) -> NodeId {
        match self.free.last() {
            Some(&index) => {
                let generation = self.slots.get(index as usize).map_or(0, |slot| slot.generation);
                NodeId::new(index, generation)
            }
            None => NodeId::new(self.slots.len() as u32, 0),
        }
    }

    fn occupy(&mut self, endpoint: Arc<Endpoint>) {
        let id = endpoint.id();
        match self.slots.get_mut(id.index()) {
            Some(slot) => {
                if self.free.last() == Some(&(id.index() as u32)) {
                    self.free.pop();
                }
                slot.generation = id.generation();
                slot.endpoint = Some(endpoint);
            }
            None => self.slots.push(Slot {
                generation: id.generation(),
                endpoint: Some(endpoint),
            }),
        }
    }

    fn vacate(&mut self, id: NodeId) -> Option<Arc<Endpoint>> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())?;
        let endpoint = slot.endpoint.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        Some(endpoint)
    }

    fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.slots.iter().filter_map(|slot| slot.endpoint.as_ref())
    }
}

/// Arena of routing nodes sharing one [`RouterContext`]
#[derive(Debug)]
pub struct EndpointTree {
    context: RouterContext,
    nodes: RwLock<Arena>,
    initialized: AtomicBool,
}

impl EndpointTree {
    pub fn new(context: RouterContext) -> Self {
        Self {
            context,
            nodes: RwLock::new(Arena::default()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &RouterContext {
        &self.context
    }

    /// Current time in milliseconds from the context clock
    pub fn now(&self) -> u64 {
        self.context.clock().now_millis()
    }

    // ============================================
    // Structure
    // ============================================

    /// Add a node. Children named by `kind` must exist and have no parent.
    ///
    /// Nodes added after [`EndpointTree::init`] are initialized right away.
    pub fn insert(&self, name: Option<&str>, kind: EndpointKind) -> Result<NodeId> {
        kind.validate()?;
        let children = kind.children();
        let liveness = LivenessState::new(match kind.leaf() {
            Some(leaf) => {
                SuspendPolicy::from_definition(leaf.definition(), self.context.config().default_suspend)
            }
            None => SuspendPolicy::until_child_active(),
        });

        let endpoint = {
            let mut nodes = self.nodes.write();
            let mut seen = HashSet::new();
            for child in &children {
                let node = nodes.get(*child).ok_or(RouteError::UnknownNode(*child))?;
                if !seen.insert(*child) {
                    return Err(RouteError::InvalidTopology(format!(
                        "endpoint {child} listed twice"
                    )));
                }
                if let Some(parent) = node.parent() {
                    return Err(RouteError::InvalidTopology(format!(
                        "endpoint {child} already belongs to {parent}"
                    )));
                }
            }

            let id = nodes.next_id();
            let endpoint = Arc::new(Endpoint::new(id, name.map(str::to_string), kind, liveness));
            for child in &children {
                if let Some(node) = nodes.get(*child) {
                    node.set_parent(Some(id));
                }
            }
            nodes.occupy(endpoint.clone());
            endpoint
        };

        info!(
            endpoint = %endpoint,
            id = %endpoint.id(),
            kind = endpoint.kind().type_name(),
            children = children.len(),
            "Registered endpoint"
        );

        if self.initialized.load(Ordering::Acquire) {
            endpoint.init(self)?;
        }
        Ok(endpoint.id())
    }

    /// Leaf created by a recipient list for a computed address. It never
    /// shares liveness through the cluster.
    pub(crate) fn insert_dynamic_leaf(&self, owner: NodeId, address: &str) -> Result<NodeId> {
        let definition = EndpointDefinition::builder()
            .address(address)
            .replicate_state(false)
            .build();
        let name = format!("dynamic-recipient-{}", uuid::Uuid::new_v4());
        let id = self.insert(Some(&name), EndpointKind::Address(LeafEndpoint::new(definition)))?;
        self.set_parent(id, Some(owner))?;
        Ok(id)
    }

    /// Build the subtree described by `blueprint`, children first
    pub fn build(&self, blueprint: &EndpointBlueprint) -> Result<NodeId> {
        let config = self.context.config();
        match blueprint {
            EndpointBlueprint::Address { name, definition } => self.insert(
                name.as_deref(),
                EndpointKind::Address(LeafEndpoint::new(definition.clone())),
            ),
            EndpointBlueprint::Wsdl {
                name,
                service,
                definition,
            } => self.insert(
                name.as_deref(),
                EndpointKind::Wsdl(LeafEndpoint::new(
                    definition.clone().with_service(service.clone()),
                )),
            ),
            EndpointBlueprint::Default { name, definition } => self.insert(
                name.as_deref(),
                EndpointKind::Default(LeafEndpoint::new(definition.clone())),
            ),
            EndpointBlueprint::Indirect { name, key } => self.insert(
                name.as_deref(),
                EndpointKind::Indirect(IndirectEndpoint::new(key.clone())),
            ),
            EndpointBlueprint::Template {
                name,
                template,
                parameters,
            } => self.insert(
                name.as_deref(),
                EndpointKind::Template(TemplateEndpoint::new(template.clone(), parameters.clone())),
            ),
            EndpointBlueprint::LoadBalance {
                name,
                algorithm,
                failover,
                children,
            } => {
                let children = self.build_children(children)?;
                self.insert(
                    name.as_deref(),
                    EndpointKind::LoadBalance(LoadBalanceEndpoint::new(
                        algorithm.build(),
                        *failover,
                        children,
                    )),
                )
            }
            EndpointBlueprint::SessionAffinity {
                name,
                algorithm,
                dispatcher,
                children,
            } => {
                let children = self.build_children(children)?;
                self.insert(
                    name.as_deref(),
                    EndpointKind::SessionAffinity(SessionAffinityEndpoint::new(
                        algorithm.build(),
                        dispatcher.build(),
                        children,
                        config.session_table_capacity,
                        config.session_timeout(),
                    )),
                )
            }
            EndpointBlueprint::RecipientList {
                name,
                children,
                members,
                recipients,
                pool_size,
            } => {
                let members = members
                    .iter()
                    .map(|member| {
                        url::Url::parse(member).map_err(|e| {
                            RouteError::InvalidBlueprint(format!("member '{member}': {e}"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let children = self.build_children(children)?;
                self.insert(
                    name.as_deref(),
                    EndpointKind::RecipientList(RecipientListEndpoint::new(
                        children,
                        members,
                        recipients.clone(),
                        pool_size.unwrap_or(config.dynamic_pool_size),
                    )),
                )
            }
        }
    }

    fn build_children(&self, children: &[EndpointBlueprint]) -> Result<Vec<NodeId>> {
        children.iter().map(|child| self.build(child)).collect()
    }

    /// Convenience for a load balancer over existing children
    pub fn insert_load_balance(
        &self,
        name: Option<&str>,
        algorithm: AlgorithmKind,
        failover: bool,
        children: Vec<NodeId>,
    ) -> Result<NodeId> {
        self.insert(
            name,
            EndpointKind::LoadBalance(LoadBalanceEndpoint::new(algorithm.build(), failover, children)),
        )
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Endpoint>> {
        self.nodes.read().get(id).cloned()
    }

    pub(crate) fn endpoint(&self, id: NodeId) -> Result<Arc<Endpoint>> {
        self.get(id).ok_or(RouteError::UnknownNode(id))
    }

    /// First node carrying `name`
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .read()
            .endpoints()
            .find(|endpoint| endpoint.name() == Some(name))
            .map(|endpoint| endpoint.id())
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.read().endpoints().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of arena slots, occupied or free
    pub fn slot_count(&self) -> usize {
        self.nodes.read().slots.len()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|endpoint| endpoint.parent())
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id)
            .map(|endpoint| endpoint.kind().children())
            .unwrap_or_default()
    }

    pub fn set_parent(&self, child: NodeId, parent: Option<NodeId>) -> Result<()> {
        if let Some(parent) = parent {
            if parent == child {
                return Err(RouteError::InvalidTopology(format!(
                    "endpoint {child} cannot be its own parent"
                )));
            }
            self.endpoint(parent)?;
        }
        self.endpoint(child)?.set_parent(parent);
        Ok(())
    }

    /// Destroy a node and free its slot. Its children become roots.
    pub fn remove(&self, id: NodeId) -> Option<Arc<Endpoint>> {
        let removed = self.nodes.write().vacate(id)?;
        removed.destroy(self);
        for child in removed.kind().children() {
            if let Some(node) = self.get(child) {
                node.set_parent(None);
            }
        }
        debug!(endpoint = %removed, "Removed endpoint");
        Some(removed)
    }

    pub(crate) fn is_session_affinity(&self, id: NodeId) -> bool {
        self.get(id)
            .map_or(false, |e| matches!(e.kind(), EndpointKind::SessionAffinity(_)))
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Initialize every node; templates are instantiated here
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let endpoints: Vec<Arc<Endpoint>> = self.nodes.read().endpoints().cloned().collect();
        for endpoint in &endpoints {
            endpoint.init(self)?;
        }
        info!(endpoints = self.len(), "Endpoint tree initialized");
        Ok(())
    }

    /// Release pooled endpoints and sessions and stop sharing liveness
    pub fn destroy(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let endpoints: Vec<Arc<Endpoint>> = self.nodes.read().endpoints().cloned().collect();
        for endpoint in &endpoints {
            endpoint.destroy(self);
        }
        info!(endpoints = self.len(), "Endpoint tree destroyed");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // ============================================
    // Routing
    // ============================================

    /// Route `message` through the node `id`.
    ///
    /// Delivery failures do not show up here; they come back through
    /// [`EndpointTree::handle_fault`]. An error means the message could not
    /// be routed at all (bad reference, uninitialized template, no one left
    /// to take a failure).
    pub fn send(&self, id: NodeId, message: Message) -> Result<()> {
        self.endpoint(id)?.send(self, message)
    }

    /// Whether `id` may receive traffic; unknown nodes are inactive
    pub fn is_active(&self, id: NodeId) -> bool {
        self.get(id).map_or(false, |endpoint| endpoint.is_active(self))
    }

    /// Reactivate, or suspend according to the node's policy
    pub fn set_active(&self, id: NodeId, active: bool) -> Result<()> {
        self.endpoint(id)?.set_active(self, active)
    }

    pub fn ready_to_send(&self, id: NodeId) -> bool {
        self.get(id)
            .map_or(false, |endpoint| endpoint.ready_to_send(self))
    }

    /// Failure of `child` reported to `parent`
    pub fn on_child_endpoint_fail(
        &self,
        parent: NodeId,
        child: Option<NodeId>,
        message: Message,
    ) -> Result<()> {
        self.endpoint(parent)?
            .on_child_endpoint_fail(self, child, message)
    }

    /// Re-entry point for a failed delivery.
    ///
    /// The transport sets a fault on the message and hands it back; the
    /// handler on top of its fault stack decides what happens next.
    pub fn handle_fault(&self, mut message: Message) -> Result<()> {
        loop {
            match message.pop_fault_handler() {
                Some(FaultHandlerRef::Endpoint(id)) => match self.get(id) {
                    Some(endpoint) => return endpoint.on_fault(self, message),
                    None => warn!(
                        endpoint_id = %id,
                        message_id = %message.id(),
                        "Fault reported for removed endpoint"
                    ),
                },
                Some(FaultHandlerRef::Terminal(handler)) => {
                    handler.handle_fault(message);
                    return Ok(());
                }
                None => return fault::unhandled(&message),
            }
        }
    }

    /// A delivery through `id` succeeded; clears its failure streak
    pub fn on_success(&self, id: NodeId) {
        if let Some(endpoint) = self.get(id) {
            endpoint.liveness().record_success();
        }
    }

    /// Bind the server-initiated session announced by `response` along the
    /// path its request recorded
    pub fn update_session(&self, response: &Message, path: &[NodeId]) -> Result<()> {
        let Some((first, rest)) = path.split_first() else {
            return Ok(());
        };
        let endpoint = self.endpoint(*first)?;
        match endpoint.kind() {
            EndpointKind::SessionAffinity(sa) => sa.update_session(self, &endpoint, response, rest),
            _ => Err(RouteError::InvalidTopology(format!(
                "{endpoint} is not a session affinity endpoint"
            ))),
        }
    }

    // ============================================
    // Administration
    // ============================================

    /// Take `id` out of rotation until [`EndpointTree::switch_on`]
    pub fn switch_off(&self, id: NodeId) -> Result<()> {
        let endpoint = self.endpoint(id)?;
        endpoint.liveness().switch_off()?;
        info!(endpoint = %endpoint, "Endpoint switched off");
        Ok(())
    }

    pub fn switch_on(&self, id: NodeId) -> Result<()> {
        let endpoint = self.endpoint(id)?;
        endpoint.liveness().switch_on()?;
        info!(endpoint = %endpoint, "Endpoint switched on");
        Ok(())
    }

    pub fn liveness(&self, id: NodeId) -> Option<LivenessSnapshot> {
        self.get(id).map(|endpoint| endpoint.liveness().snapshot())
    }

    /// Sweep expired bindings from every session table
    pub fn clear_expired_sessions(&self) -> usize {
        let now = self.now();
        let endpoints: Vec<Arc<Endpoint>> = self.nodes.read().endpoints().cloned().collect();
        endpoints
            .iter()
            .filter_map(|endpoint| match endpoint.kind() {
                EndpointKind::SessionAffinity(sa) => Some(sa.sessions().clear_expired(now)),
                _ => None,
            })
            .sum()
    }
}
