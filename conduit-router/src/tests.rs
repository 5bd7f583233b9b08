//! Routing scenarios driven through the public tree API with a recording
//! transport and a manual clock

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::algorithm::AlgorithmKind;
use crate::endpoint::{
    EndpointKind, IndirectEndpoint, LeafEndpoint, RecipientListEndpoint, RecipientSource,
    SessionAffinityEndpoint, TemplateEndpoint,
};
use crate::liveness::{EndpointState, InMemoryClusterState};
use crate::session::{ClientIdDispatcher, HttpCookieDispatcher, SessionDispatcher};
use crate::*;

// ============================================
// Test support
// ============================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingTransport {
    fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, definition: &EndpointDefinition, message: Message) {
        self.deliveries.lock().push(Delivery {
            definition: definition.clone(),
            message,
        });
    }
}

#[derive(Default)]
struct CollectingFaultHandler {
    faults: Mutex<Vec<Message>>,
}

impl CollectingFaultHandler {
    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.faults.lock())
    }
}

impl FaultHandler for CollectingFaultHandler {
    fn handle_fault(&self, message: Message) {
        self.faults.lock().push(message);
    }

    fn name(&self) -> &str {
        "collecting"
    }
}

struct Harness {
    tree: EndpointTree,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
    faults: Arc<CollectingFaultHandler>,
}

impl Harness {
    fn new() -> Self {
        Self::build(RouterConfig::default(), |context| context, true)
    }

    fn with_config(config: RouterConfig) -> Self {
        Self::build(config, |context| context, true)
    }

    fn build(
        config: RouterConfig,
        customize: impl FnOnce(RouterContext) -> RouterContext,
        init: bool,
    ) -> Self {
        init_tracing();
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(ManualClock::new(0));
        let context = customize(
            RouterContext::new(config, transport.clone()).with_clock(clock.clone()),
        );
        let tree = EndpointTree::new(context);
        if init {
            tree.init().unwrap();
        }
        Self {
            tree,
            transport,
            clock,
            faults: Arc::new(CollectingFaultHandler::default()),
        }
    }

    fn address(&self, name: &str) -> NodeId {
        self.leaf(name, EndpointDefinition::for_address(format!("http://{name}/svc")))
    }

    fn leaf(&self, name: &str, definition: EndpointDefinition) -> NodeId {
        self.tree
            .insert(Some(name), EndpointKind::Address(LeafEndpoint::new(definition)))
            .unwrap()
    }

    fn load_balance(&self, failover: bool, children: Vec<NodeId>) -> NodeId {
        self.tree
            .insert_load_balance(Some("lb"), AlgorithmKind::RoundRobin, failover, children)
            .unwrap()
    }

    fn session_affinity(
        &self,
        dispatcher: Arc<dyn SessionDispatcher>,
        children: Vec<NodeId>,
    ) -> NodeId {
        let config = self.tree.context().config();
        let kind = EndpointKind::SessionAffinity(SessionAffinityEndpoint::new(
            AlgorithmKind::RoundRobin.build(),
            dispatcher,
            children,
            config.session_table_capacity,
            config.session_timeout(),
        ));
        self.tree.insert(Some("sa"), kind).unwrap()
    }

    /// Request with the collecting handler at the bottom of its fault stack
    fn message(&self) -> Message {
        let mut message = Message::streaming(vec![b"<order/>".to_vec()]);
        message.push_fault_handler(FaultHandlerRef::Terminal(self.faults.clone()));
        message
    }

    fn deliveries(&self) -> Vec<Delivery> {
        self.transport.take()
    }

    fn single_delivery(&self) -> Delivery {
        let mut deliveries = self.deliveries();
        assert_eq!(deliveries.len(), 1, "expected exactly one delivery");
        deliveries.remove(0)
    }

    /// Report `delivery` as failed with `code`, the way a transport would
    fn fail(&self, delivery: Delivery, code: i32) -> Result<()> {
        let mut message = delivery.message;
        message.set_fault(MessageFault::new(code, "delivery failed"));
        self.tree.handle_fault(message)
    }

    fn sessions_of(&self, sa: NodeId, key: &str) -> Option<NodeId> {
        let endpoint = self.tree.get(sa).unwrap();
        match endpoint.kind() {
            EndpointKind::SessionAffinity(sa) => sa.sessions().get(key).map(|b| b.endpoint),
            other => panic!("not a session affinity endpoint: {:?}", other),
        }
    }
}

fn delivered_by(delivery: &Delivery) -> NodeId {
    match delivery.message.fault_stack().last() {
        Some(FaultHandlerRef::Endpoint(id)) => *id,
        other => panic!("expected a leaf on top of the fault stack, got {:?}", other),
    }
}

// ============================================
// Structure
// ============================================

#[test]
fn test_insert_sets_parent_links() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let lb = h.load_balance(true, vec![a, b]);

    assert_eq!(h.tree.parent(a), Some(lb));
    assert_eq!(h.tree.children(lb), vec![a, b]);
    assert_eq!(h.tree.find_by_name("b"), Some(b));
    assert_eq!(h.tree.len(), 3);
}

#[test]
fn test_insert_rejects_shared_or_unknown_children() {
    let h = Harness::new();
    let a = h.address("a");
    h.load_balance(true, vec![a]);

    let shared = h
        .tree
        .insert_load_balance(None, AlgorithmKind::RoundRobin, true, vec![a]);
    assert!(matches!(shared, Err(RouteError::InvalidTopology(_))));

    let unknown = h
        .tree
        .insert_load_balance(None, AlgorithmKind::RoundRobin, true, vec![NodeId(99)]);
    assert!(matches!(unknown, Err(RouteError::UnknownNode(NodeId(99)))));

    let b = h.address("b");
    let duplicate = h
        .tree
        .insert_load_balance(None, AlgorithmKind::RoundRobin, true, vec![b, b]);
    assert!(matches!(duplicate, Err(RouteError::InvalidTopology(_))));
}

#[test]
fn test_recipient_list_needs_a_target_source() {
    let h = Harness::new();
    let empty = RecipientListEndpoint::new(Vec::new(), Vec::new(), None, 4);
    let result = h.tree.insert(None, EndpointKind::RecipientList(empty));
    assert!(matches!(result, Err(RouteError::InvalidTopology(_))));
}

#[test]
fn test_removed_node_stops_resolving() {
    let h = Harness::new();
    let a = h.address("a");
    assert!(h.tree.remove(a).is_some());
    assert!(h.tree.get(a).is_none());
    assert!(!h.tree.is_active(a));
    assert!(matches!(h.tree.send(a, h.message()), Err(RouteError::UnknownNode(_))));

    // the slot is reused under a new generation
    let b = h.address("b");
    assert_eq!(b.index(), a.index());
    assert_ne!(a, b);
    assert!(h.tree.get(a).is_none());
    assert_eq!(h.tree.find_by_name("b"), Some(b));
    assert_eq!(h.tree.slot_count(), 1);
}

// ============================================
// Leaves
// ============================================

#[test]
fn test_leaf_delivers_through_transport() {
    let h = Harness::new();
    let a = h.address("a");

    h.tree.send(a, h.message()).unwrap();

    let delivery = h.single_delivery();
    assert_eq!(delivery.address(), Some("http://a/svc"));
    assert_eq!(delivered_by(&delivery), a);
    assert_eq!(
        delivery.message.property(endpoint::LAST_ENDPOINT_PROPERTY),
        Some(&serde_json::Value::from("Endpoint [a]"))
    );
}

#[test]
fn test_wsdl_and_default_leaves_pick_their_address() {
    let h = Harness::new();
    let wsdl = h
        .tree
        .build(&EndpointBlueprint::Wsdl {
            name: Some("stock".to_string()),
            service: ServiceDescriptor {
                wsdl_uri: "file:stock.wsdl".to_string(),
                service: "StockQuoteService".to_string(),
                port: "StockQuoteSoap11".to_string(),
                address: "http://stock/soap".to_string(),
            },
            definition: EndpointDefinition::default(),
        })
        .unwrap();
    let default = h
        .tree
        .insert(
            Some("default"),
            EndpointKind::Default(LeafEndpoint::new(EndpointDefinition::default())),
        )
        .unwrap();

    h.tree.send(wsdl, h.message()).unwrap();
    assert_eq!(h.single_delivery().address(), Some("http://stock/soap"));

    h.tree
        .send(default, h.message().with_to("http://elsewhere/orders"))
        .unwrap();
    assert_eq!(h.single_delivery().address(), Some("http://elsewhere/orders"));

    let missing = h.tree.send(default, h.message());
    assert!(matches!(missing, Err(RouteError::MissingDestination { .. })));
    assert!(h.deliveries().is_empty());
}

#[test]
fn test_fatal_fault_suspends_and_reaches_terminal_handler() {
    let h = Harness::new();
    let a = h.address("a");

    h.tree.send(a, h.message()).unwrap();
    h.fail(h.single_delivery(), codes::CONNECTION_FAILED).unwrap();

    assert!(!h.tree.is_active(a));
    let faults = h.faults.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].error_code(), Some(codes::CONNECTION_FAILED));
}

#[test]
fn test_non_fatal_fault_keeps_leaf_active() {
    let h = Harness::new();
    let a = h.leaf(
        "a",
        EndpointDefinition::builder()
            .address("http://a/svc")
            .suspend_codes([codes::CONNECTION_FAILED])
            .build(),
    );

    h.tree.send(a, h.message()).unwrap();
    h.fail(h.single_delivery(), 500).unwrap();

    assert!(h.tree.is_active(a));
    assert_eq!(h.faults.take().len(), 1);
}

#[test]
fn test_suspend_and_recover_timing() {
    let h = Harness::new();
    let a = h.leaf(
        "a",
        EndpointDefinition::builder()
            .address("http://a/svc")
            .initial_suspend(Duration::from_millis(1_000))
            .build(),
    );

    h.clock.set(5_000);
    h.tree.set_active(a, false).unwrap();

    h.clock.set(5_999);
    assert!(!h.tree.is_active(a));
    h.clock.set(6_001);
    assert!(h.tree.is_active(a));
}

#[test]
fn test_geometric_backoff_through_faults() {
    let h = Harness::new();
    let a = h.leaf(
        "a",
        EndpointDefinition::builder()
            .address("http://a/svc")
            .initial_suspend(Duration::from_millis(100))
            .progression_factor(2.0)
            .maximum_suspend(Duration::from_millis(300))
            .build(),
    );

    let mut durations = Vec::new();
    for _ in 0..4 {
        // each attempt happens after the previous suspension elapsed
        h.clock.advance(Duration::from_secs(1));
        assert!(h.tree.is_active(a));
        h.tree.send(a, h.message()).unwrap();
        h.fail(h.single_delivery(), codes::CONNECTION_FAILED).unwrap();
        durations.push(h.tree.liveness(a).unwrap().last_suspend_millis.unwrap());
    }
    assert_eq!(durations, vec![100, 200, 300, 300]);

    h.tree.on_success(a);
    assert_eq!(h.tree.liveness(a).unwrap().consecutive_failures, 0);
}

#[test]
fn test_timeout_retries_before_suspending() {
    let h = Harness::new();
    let a = h.leaf(
        "a",
        EndpointDefinition::builder()
            .address("http://a/svc")
            .initial_suspend(Duration::from_secs(30))
            .retries_on_timeout(2, Duration::from_millis(100))
            .build(),
    );

    for expected in [EndpointState::Timeout, EndpointState::Timeout, EndpointState::Suspended] {
        h.clock.advance(Duration::from_secs(1));
        h.tree.send(a, h.message()).unwrap();
        h.fail(h.single_delivery(), codes::CONNECTION_TIMEOUT).unwrap();
        assert_eq!(h.tree.liveness(a).unwrap().state, expected);
    }
    assert_eq!(h.faults.take().len(), 3);
}

#[test]
fn test_empty_fault_stack_is_reported() {
    let h = Harness::new();
    let a = h.address("a");

    h.tree.send(a, Message::new("no handler")).unwrap();
    let result = h.fail(h.single_delivery(), codes::CONNECTION_FAILED);
    assert!(matches!(result, Err(RouteError::UnhandledFault { .. })));
}

#[test]
fn test_switch_off_overrides_recovery() {
    let h = Harness::new();
    let a = h.address("a");

    h.tree.switch_off(a).unwrap();
    h.tree.set_active(a, true).unwrap();
    assert!(!h.tree.is_active(a));
    assert_eq!(h.tree.liveness(a).unwrap().state, EndpointState::Off);

    h.tree.switch_on(a).unwrap();
    assert!(h.tree.is_active(a));
}

#[test]
fn test_switched_off_leaf_is_not_ready_before_init() {
    let h = Harness::build(RouterConfig::default(), |context| context, false);
    let a = h.address("a");
    let b = h.address("b");
    h.tree.switch_off(b).unwrap();

    assert!(h.tree.ready_to_send(a));
    assert!(!h.tree.ready_to_send(b));

    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_children(vec![a, b], 4)),
        )
        .unwrap();
    h.tree.send(rl, h.message()).unwrap();

    let delivery = h.single_delivery();
    assert_eq!(delivered_by(&delivery), a);
    assert_eq!(delivery.message.sequence(), Some(MessageSequence { index: 0, total: 1 }));
}

// ============================================
// Load balance
// ============================================

#[test]
fn test_round_robin_visits_children_in_order() {
    let h = Harness::new();
    let children = vec![h.address("a"), h.address("b"), h.address("c")];
    let lb = h.load_balance(true, children.clone());

    for _ in 0..2 {
        for expected in &children {
            h.tree.send(lb, h.message()).unwrap();
            assert_eq!(delivered_by(&h.single_delivery()), *expected);
        }
    }
}

#[test]
fn test_load_balance_fails_over_to_next_child() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let lb = h.load_balance(true, vec![a, b]);

    h.tree.send(lb, h.message()).unwrap();
    let first = h.single_delivery();
    assert_eq!(delivered_by(&first), a);
    assert!(first.message.payload().is_built());

    h.fail(first, codes::CONNECTION_FAILED).unwrap();

    assert_eq!(delivered_by(&h.single_delivery()), b);
    assert!(!h.tree.is_active(a));
    assert!(h.faults.take().is_empty());
}

#[test]
fn test_load_balance_reports_when_every_child_failed() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let lb = h.load_balance(true, vec![a, b]);

    h.tree.send(lb, h.message()).unwrap();
    h.fail(h.single_delivery(), codes::CONNECTION_FAILED).unwrap();
    h.fail(h.single_delivery(), codes::CONNECTION_FAILED).unwrap();

    assert!(h.deliveries().is_empty());
    let faults = h.faults.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].error_code(), Some(codes::CONNECTION_FAILED));
    assert!(!h.tree.is_active(lb));

    // a fresh message gets the load balancer's own code
    h.tree.send(lb, h.message()).unwrap();
    assert_eq!(h.faults.take()[0].error_code(), Some(codes::LB_NONE_READY));

    // a recovered child reactivates the load balancer on the next readiness check
    h.tree.set_active(a, true).unwrap();
    assert!(h.tree.is_active(lb));
}

#[test]
fn test_load_balance_without_failover_passes_failure_on() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let lb = h.load_balance(false, vec![a, b]);

    h.tree.send(lb, h.message()).unwrap();
    let delivery = h.single_delivery();
    assert!(!delivery.message.payload().is_built());
    h.fail(delivery, codes::CONNECTION_FAILED).unwrap();

    assert!(h.deliveries().is_empty());
    assert_eq!(h.faults.take().len(), 1);
    assert!(h.tree.is_active(b));
}

#[test]
fn test_non_fatal_failover_is_bounded() {
    let h = Harness::new();
    let definition = |name: &str| {
        EndpointDefinition::builder()
            .address(format!("http://{name}/svc"))
            .suspend_codes([codes::CONNECTION_FAILED])
            .build()
    };
    let a = h.leaf("a", definition("a"));
    let b = h.leaf("b", definition("b"));
    let lb = h.load_balance(true, vec![a, b]);

    h.tree.send(lb, h.message()).unwrap();
    for _ in 0..2 {
        h.fail(h.single_delivery(), 500).unwrap();
    }
    h.fail(h.single_delivery(), 500).unwrap();

    assert!(h.deliveries().is_empty());
    assert_eq!(h.faults.take()[0].error_code(), Some(500));
    assert!(h.tree.is_active(a) && h.tree.is_active(b));
}

// ============================================
// Session affinity
// ============================================

#[test]
fn test_client_session_sticks_to_bound_child() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let sa = h.session_affinity(Arc::new(ClientIdDispatcher::new()), vec![a, b]);

    for _ in 0..3 {
        h.tree
            .send(sa, h.message().with_header("ClientID", "c-1"))
            .unwrap();
        assert_eq!(delivered_by(&h.single_delivery()), a);
    }
    assert_eq!(h.sessions_of(sa, "c-1"), Some(a));

    // another session starts on the next child
    h.tree
        .send(sa, h.message().with_header("ClientID", "c-2"))
        .unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), b);
}

#[test]
fn test_first_message_failure_rebinds_session() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let sa = h.session_affinity(Arc::new(ClientIdDispatcher::new()), vec![a, b]);

    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    let first = h.single_delivery();
    assert!(first.message.payload().is_built());
    h.fail(first, codes::CONNECTION_FAILED).unwrap();

    assert_eq!(delivered_by(&h.single_delivery()), b);
    assert_eq!(h.sessions_of(sa, "c-1"), Some(b));
    assert!(h.faults.take().is_empty());
}

#[test]
fn test_bound_session_does_not_fail_over() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let sa = h.session_affinity(Arc::new(ClientIdDispatcher::new()), vec![a, b]);

    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    h.single_delivery();

    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    h.fail(h.single_delivery(), codes::CONNECTION_FAILED).unwrap();

    assert!(h.deliveries().is_empty());
    assert_eq!(h.faults.take().len(), 1);
    assert_eq!(h.sessions_of(sa, "c-1"), Some(a));

    // the bound child is down, so the session is reported as not ready
    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    assert!(h.deliveries().is_empty());
    assert_eq!(h.faults.take()[0].error_code(), Some(codes::SAL_NOT_READY));
}

#[test]
fn test_server_session_binds_on_response() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let sa = h.session_affinity(Arc::new(HttpCookieDispatcher::new()), vec![a, b]);

    h.tree.send(sa, h.message()).unwrap();
    let first = h.single_delivery();
    assert_eq!(first.message.endpoint_path(), &[sa, a]);
    assert_eq!(h.sessions_of(sa, "s-1"), None);

    let response = Message::new_response("").with_header("Set-Cookie", "JSESSIONID=s-1; Path=/");
    h.tree
        .update_session(&response, first.message.endpoint_path())
        .unwrap();
    assert_eq!(h.sessions_of(sa, "s-1"), Some(a));

    for _ in 0..2 {
        h.tree
            .send(sa, h.message().with_header("Cookie", "JSESSIONID=s-1"))
            .unwrap();
        assert_eq!(delivered_by(&h.single_delivery()), a);
    }
}

#[test]
fn test_nested_server_sessions_bind_every_level() {
    let h = Harness::new();
    let a = h.address("a");
    let b = h.address("b");
    let config = h.tree.context().config().clone();
    let inner = h
        .tree
        .insert(
            Some("inner"),
            EndpointKind::SessionAffinity(SessionAffinityEndpoint::new(
                AlgorithmKind::RoundRobin.build(),
                Arc::new(HttpCookieDispatcher::new()),
                vec![a, b],
                config.session_table_capacity,
                config.session_timeout(),
            )),
        )
        .unwrap();
    let c = h.address("c");
    let outer = h.session_affinity(Arc::new(HttpCookieDispatcher::new()), vec![inner, c]);

    h.tree.send(outer, h.message()).unwrap();
    let delivery = h.single_delivery();
    assert_eq!(delivery.message.endpoint_path(), &[outer, inner, a]);

    let response = Message::new_response("").with_header("Set-Cookie", "JSESSIONID=s-9");
    h.tree
        .update_session(&response, delivery.message.endpoint_path())
        .unwrap();
    assert_eq!(h.sessions_of(outer, "s-9"), Some(inner));
    assert_eq!(h.sessions_of(inner, "s-9"), Some(a));
}

#[test]
fn test_update_session_requires_session_endpoint() {
    let h = Harness::new();
    let a = h.address("a");
    let result = h.tree.update_session(&Message::new_response(""), &[a]);
    assert!(matches!(result, Err(RouteError::InvalidTopology(_))));
}

#[test]
fn test_idle_sessions_expire() {
    let h = Harness::with_config(RouterConfig {
        session_timeout_ms: 1_000,
        ..RouterConfig::default()
    });
    let a = h.address("a");
    let b = h.address("b");
    let sa = h.session_affinity(Arc::new(ClientIdDispatcher::new()), vec![a, b]);

    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), a);

    h.clock.advance(Duration::from_millis(1_500));
    h.tree
        .send(sa, h.message().with_header("ClientID", "c-1"))
        .unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), b);

    h.tree
        .send(sa, h.message().with_header("ClientID", "c-2"))
        .unwrap();
    h.single_delivery();
    h.clock.advance(Duration::from_millis(5_000));
    assert_eq!(h.tree.clear_expired_sessions(), 2);
}

// ============================================
// Recipient list
// ============================================

#[test]
fn test_fan_out_to_ready_children_only() {
    let h = Harness::new();
    let children = vec![h.address("a"), h.address("b"), h.address("c"), h.address("d")];
    h.tree.switch_off(children[3]).unwrap();
    let rl = h
        .tree
        .insert(
            Some("rl"),
            EndpointKind::RecipientList(RecipientListEndpoint::with_children(children.clone(), 4)),
        )
        .unwrap();

    let original = h.message();
    let original_id = original.id();
    h.tree.send(rl, original).unwrap();

    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 3);
    for (index, delivery) in deliveries.iter().enumerate() {
        assert_eq!(delivered_by(delivery), children[index]);
        assert_eq!(
            delivery.message.sequence(),
            Some(MessageSequence { index, total: 3 })
        );
        assert_ne!(delivery.message.id(), original_id);
        assert!(delivery.message.payload().is_built());
        let stack = delivery.message.fault_stack();
        assert!(matches!(stack[stack.len() - 2], FaultHandlerRef::Endpoint(id) if id == rl));
    }

    let mut copies: Vec<Message> = deliveries.into_iter().map(|d| d.message).collect();
    copies[0].set_property("seen", true);
    assert!(copies[1].property("seen").is_none());
}

#[test]
fn test_recipient_failure_does_not_affect_others() {
    let h = Harness::new();
    let children = vec![h.address("a"), h.address("b"), h.address("c")];
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_children(children, 4)),
        )
        .unwrap();

    h.tree.send(rl, h.message()).unwrap();
    let mut deliveries = h.deliveries();
    let failed = deliveries.remove(1);
    h.fail(failed, codes::CONNECTION_FAILED).unwrap();

    let faults = h.faults.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].sequence(), Some(MessageSequence { index: 1, total: 3 }));
    assert!(h.deliveries().is_empty());
    assert_eq!(deliveries.len(), 2);
}

#[test]
fn test_no_ready_recipient_is_reported_once() {
    let h = Harness::new();
    let children = vec![h.address("a"), h.address("b")];
    for child in &children {
        h.tree.switch_off(*child).unwrap();
    }
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_children(children, 4)),
        )
        .unwrap();
    assert!(!h.tree.ready_to_send(rl));

    h.tree.send(rl, h.message()).unwrap();

    assert!(h.deliveries().is_empty());
    let faults = h.faults.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].error_code(), Some(codes::RL_NONE_READY));
}

#[test]
fn test_dynamic_recipients_are_pooled_with_lru_eviction() {
    let h = Harness::new();
    let rl = h
        .tree
        .insert(
            Some("dynamic"),
            EndpointKind::RecipientList(RecipientListEndpoint::with_recipients(
                RecipientSource::Property("recipients".to_string()),
                2,
            )),
        )
        .unwrap();

    h.tree
        .send(rl, h.message().with_property("recipients", "http://a/x, ,http://b/x"))
        .unwrap();
    let first = h.deliveries();
    assert_eq!(first.len(), 2);
    let evicted = delivered_by(&first[0]);
    let kept = delivered_by(&first[1]);
    assert_eq!(h.tree.parent(kept), Some(rl));
    assert_eq!(h.tree.len(), 3);

    h.tree
        .send(rl, h.message().with_property("recipients", "http://c/x"))
        .unwrap();
    assert_eq!(h.single_delivery().address(), Some("http://c/x"));
    assert_eq!(h.tree.len(), 3);
    assert!(h.tree.get(evicted).is_none());

    // a pooled address reuses its leaf
    h.tree
        .send(rl, h.message().with_property("recipients", "http://b/x"))
        .unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), kept);

    let endpoint = h.tree.get(rl).unwrap();
    let EndpointKind::RecipientList(list) = endpoint.kind() else {
        panic!("not a recipient list");
    };
    assert_eq!(list.pool().len(), 2);
    assert!(!list.pool().contains("http://a/x"));

    h.tree.destroy();
    assert!(list.pool().is_empty());
    assert_eq!(h.tree.len(), 1);
}

#[test]
fn test_dynamic_list_larger_than_pool_reaches_every_recipient() {
    let h = Harness::new();
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_recipients(
                RecipientSource::Literal("http://a/x,http://b/x,http://c/x".to_string()),
                2,
            )),
        )
        .unwrap();

    h.tree.send(rl, h.message()).unwrap();

    let mut deliveries = h.deliveries();
    let addresses: Vec<&str> = deliveries.iter().filter_map(Delivery::address).collect();
    assert_eq!(addresses, vec!["http://a/x", "http://b/x", "http://c/x"]);
    for (index, delivery) in deliveries.iter().enumerate() {
        assert_eq!(
            delivery.message.sequence(),
            Some(MessageSequence { index, total: 3 })
        );
    }
    assert!(h.faults.take().is_empty());

    // the first leaf was pushed out of the pool once its copy was handed over
    let evicted = delivered_by(&deliveries[0]);
    assert!(h.tree.get(evicted).is_none());
    assert_eq!(h.tree.len(), 3);

    // its failure still reaches the producer through the list
    h.fail(deliveries.remove(0), codes::CONNECTION_FAILED).unwrap();
    let faults = h.faults.take();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].error_code(), Some(codes::CONNECTION_FAILED));
    assert_eq!(faults[0].sequence(), Some(MessageSequence { index: 0, total: 3 }));
}

#[test]
fn test_dynamic_recipient_churn_reuses_arena_slots() {
    let h = Harness::new();
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_recipients(
                RecipientSource::Property("recipients".to_string()),
                2,
            )),
        )
        .unwrap();

    let mut first = None;
    for i in 0..150 {
        let address = format!("http://host-{i}/x");
        h.tree
            .send(rl, h.message().with_property("recipients", address.clone()))
            .unwrap();
        let delivery = h.single_delivery();
        assert_eq!(delivery.address(), Some(address.as_str()));
        first.get_or_insert(delivered_by(&delivery));
    }

    // the list, two pooled leaves and one leaf created before an eviction
    assert_eq!(h.tree.slot_count(), 4);
    assert_eq!(h.tree.len(), 3);
    let first = first.unwrap();
    assert!(h.tree.get(first).is_none());
    assert!(!h.tree.is_active(first));
}

#[test]
fn test_empty_dynamic_recipient_list_reports_failure() {
    let h = Harness::new();
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_recipients(
                RecipientSource::Literal(" , ".to_string()),
                2,
            )),
        )
        .unwrap();

    h.tree.send(rl, h.message()).unwrap();
    assert_eq!(h.faults.take()[0].error_code(), Some(codes::RL_NONE_READY));
}

#[test]
fn test_members_receive_rewritten_destination() {
    let h = Harness::new();
    let members = vec![
        Url::parse("http://10.0.0.1:8080/").unwrap(),
        Url::parse("http://10.0.0.2:8080/").unwrap(),
    ];
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_members(members, 4)),
        )
        .unwrap();

    h.tree
        .send(rl, h.message().with_to("http://orders.local/orders/7?full=1"))
        .unwrap();

    let addresses: Vec<_> = h
        .deliveries()
        .iter()
        .filter_map(|d| d.address().map(str::to_string))
        .collect();
    assert_eq!(
        addresses,
        vec![
            "http://10.0.0.1:8080/orders/7?full=1".to_string(),
            "http://10.0.0.2:8080/orders/7?full=1".to_string(),
        ]
    );
}

// ============================================
// Indirect and template
// ============================================

#[test]
fn test_indirect_resolves_on_every_send() {
    let h = Harness::new();
    let indirect = h
        .tree
        .insert(
            Some("ref"),
            EndpointKind::Indirect(IndirectEndpoint::new("stock")),
        )
        .unwrap();

    let result = h.tree.send(indirect, h.message());
    assert!(matches!(
        result,
        Err(RouteError::UnresolvedReference { ref key }) if key == "stock"
    ));
    assert!(h.deliveries().is_empty());
    assert!(h.faults.take().is_empty());
    assert!(!h.tree.is_active(indirect));

    let a = h.address("a");
    let b = h.address("b");
    h.tree.context().registry().register("stock", a);
    h.tree.send(indirect, h.message()).unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), a);

    h.tree.context().registry().register("stock", b);
    h.tree.send(indirect, h.message()).unwrap();
    assert_eq!(delivered_by(&h.single_delivery()), b);

    h.tree.set_active(indirect, false).unwrap();
    assert!(!h.tree.is_active(b));
}

fn service_template() -> TemplateDefinition {
    TemplateDefinition::new(
        "service",
        vec!["host".to_string()],
        EndpointBlueprint::Address {
            name: Some("$name-leaf".to_string()),
            definition: EndpointDefinition::for_address("http://$host/api"),
        },
    )
}

#[test]
fn test_template_is_instantiated_at_init() {
    let templates = Arc::new(TemplateCatalog::new());
    templates.register(service_template());
    let h = Harness::build(
        RouterConfig::default(),
        |context| context.with_templates(templates),
        false,
    );

    let template = h
        .tree
        .insert(
            Some("orders"),
            EndpointKind::Template(TemplateEndpoint::new(
                "service",
                HashMap::from([("host".to_string(), "backend:9000".to_string())]),
            )),
        )
        .unwrap();

    let early = h.tree.send(template, h.message());
    assert!(matches!(early, Err(RouteError::NotInitialized(_))));

    h.tree.init().unwrap();
    let leaf = h.tree.find_by_name("orders-leaf").unwrap();
    assert_eq!(h.tree.parent(leaf), Some(template));
    assert_eq!(h.tree.children(template), vec![leaf]);

    h.tree.send(template, h.message()).unwrap();
    let delivery = h.single_delivery();
    assert_eq!(delivery.address(), Some("http://backend:9000/api"));
    assert_eq!(delivered_by(&delivery), leaf);
}

#[test]
fn test_unknown_template_fails_init() {
    let h = Harness::build(RouterConfig::default(), |context| context, false);
    h.tree
        .insert(
            None,
            EndpointKind::Template(TemplateEndpoint::new("missing", HashMap::new())),
        )
        .unwrap();

    let result = h.tree.init();
    assert!(matches!(result, Err(RouteError::UnknownTemplate(ref name)) if name == "missing"));
}

// ============================================
// Blueprints and clustering
// ============================================

#[test]
fn test_build_from_json_blueprint() {
    let h = Harness::new();
    let blueprint = EndpointBlueprint::from_json(
        r#"{
            "type": "load_balance",
            "name": "quotes",
            "algorithm": { "kind": "weighted_round_robin", "weights": [1, 0] },
            "children": [
                { "type": "address", "name": "q1", "definition": { "address": "http://q1/quote" } },
                { "type": "address", "name": "q2", "definition": { "address": "http://q2/quote" } }
            ]
        }"#,
    )
    .unwrap();

    let root = h.tree.build(&blueprint).unwrap();
    assert_eq!(h.tree.find_by_name("quotes"), Some(root));
    for _ in 0..3 {
        h.tree.send(root, h.message()).unwrap();
        assert_eq!(h.single_delivery().address(), Some("http://q1/quote"));
    }
}

#[test]
fn test_invalid_member_url_is_rejected() {
    let h = Harness::new();
    let blueprint = EndpointBlueprint::RecipientList {
        name: None,
        children: Vec::new(),
        members: vec!["not a url".to_string()],
        recipients: None,
        pool_size: None,
    };
    assert!(matches!(
        h.tree.build(&blueprint),
        Err(RouteError::InvalidBlueprint(_))
    ));
}

#[test]
fn test_cluster_shares_suspension_between_trees() {
    let cluster = Arc::new(InMemoryClusterState::new());
    let first = Harness::build(
        RouterConfig::default(),
        |context| context.with_cluster(cluster.clone()),
        true,
    );
    let second = Harness::build(
        RouterConfig::default(),
        |context| context.with_cluster(cluster.clone()),
        true,
    );
    let definition = EndpointDefinition::builder()
        .address("http://svc/api")
        .initial_suspend(Duration::from_millis(1_000))
        .build();
    let on_first = first.leaf("svc", definition.clone());
    let on_second = second.leaf("svc", definition);

    first.tree.set_active(on_first, false).unwrap();
    assert!(!second.tree.is_active(on_second));
    assert!(cluster.replication_count() > 0);

    second.clock.set(1_500);
    assert!(second.tree.is_active(on_second));
    first.clock.set(1_500);
    assert!(first.tree.is_active(on_first));
}

#[test]
fn test_cluster_replication_failure_surfaces_from_set_active() {
    let cluster = Arc::new(InMemoryClusterState::new());
    cluster.set_replication_failing(true);
    let h = Harness::build(
        RouterConfig::default(),
        |context| context.with_cluster(cluster.clone()),
        true,
    );
    let a = h.address("a");

    assert!(matches!(
        h.tree.set_active(a, false),
        Err(RouteError::Cluster(_))
    ));
    assert!(!h.tree.is_active(a));
}

// ============================================
// Concurrency
// ============================================

#[test]
fn test_concurrent_faults_and_sends_on_shared_leaf() {
    const ROUNDS: u32 = 200;
    let h = Harness::new();
    let a = h.leaf(
        "a",
        EndpointDefinition::builder()
            .address("http://a/svc")
            .initial_suspend(Duration::from_millis(10))
            .progression_factor(2.0)
            .maximum_suspend(Duration::from_millis(1_000))
            .build(),
    );

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let mut message = h.message();
                    message.push_fault_handler(FaultHandlerRef::Endpoint(a));
                    message.set_fault(MessageFault::new(codes::CONNECTION_FAILED, "refused"));
                    h.tree.handle_fault(message).unwrap();
                }
            });
        }
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    h.tree.send(a, h.message()).unwrap();
                    let _ = h.tree.is_active(a);
                    let _ = h.tree.ready_to_send(a);
                    h.clock.advance(Duration::from_millis(3));
                }
            });
        }
    });

    assert_eq!(h.deliveries().len(), 2 * ROUNDS as usize);
    assert_eq!(h.faults.take().len(), 2 * ROUNDS as usize);

    let snapshot = h.tree.liveness(a).unwrap();
    assert_eq!(snapshot.consecutive_failures, 2 * ROUNDS);
    assert_eq!(snapshot.last_suspend_millis, Some(1_000));
    match snapshot.state {
        EndpointState::Suspended => {
            let recover_at = snapshot.recover_at.expect("suspended leaf has a recovery time");
            assert!(recover_at <= h.tree.now() + 1_000);
        }
        EndpointState::Active => assert!(snapshot.recover_at.is_none()),
        other => panic!("unexpected state {:?}", other),
    }

    h.clock.advance(Duration::from_millis(1_001));
    assert!(h.tree.is_active(a));
}

#[test]
fn test_concurrent_dynamic_recipients_stay_within_pool_capacity() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;
    let h = Harness::new();
    let rl = h
        .tree
        .insert(
            None,
            EndpointKind::RecipientList(RecipientListEndpoint::with_recipients(
                RecipientSource::Property("recipients".to_string()),
                4,
            )),
        )
        .unwrap();
    let endpoint = h.tree.get(rl).unwrap();
    let EndpointKind::RecipientList(list) = endpoint.kind() else {
        panic!("not a recipient list");
    };

    let harness = &h;
    std::thread::scope(|s| {
        for thread in 0..THREADS {
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let message = harness
                        .message()
                        .with_property("recipients", format!("http://t{thread}-{round}/x"));
                    harness.tree.send(rl, message).unwrap();
                    assert!(list.pool().len() <= list.pool().capacity());
                }
            });
        }
    });

    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), THREADS * ROUNDS);
    let mut addresses: Vec<&str> = deliveries.iter().filter_map(Delivery::address).collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), THREADS * ROUNDS);
    assert!(h.faults.take().is_empty());

    assert_eq!(list.pool().len(), 4);
    assert_eq!(h.tree.len(), 5);
    // list, a full pool, one leaf being created and one pending removal per other sender
    assert!(h.tree.slot_count() <= 1 + 5 + (THREADS - 1));
}
