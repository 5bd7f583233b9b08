//! Explicit router context
//!
//! Everything an endpoint needs from the outside world, built once at start
//! up and handed to [`EndpointTree::new`](crate::EndpointTree::new).

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::RouterConfig;
use crate::liveness::ClusterState;
use crate::registry::{EndpointRegistry, TemplateCatalog};
use crate::transport::Transport;

/// Shared collaborators of an endpoint tree
#[derive(Clone)]
pub struct RouterContext {
    config: Arc<RouterConfig>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registry: Arc<EndpointRegistry>,
    templates: Arc<TemplateCatalog>,
    cluster: Option<Arc<dyn ClusterState>>,
}

impl RouterContext {
    pub fn new(config: RouterConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            clock: Arc::new(SystemClock),
            registry: Arc::new(EndpointRegistry::new()),
            templates: Arc::new(TemplateCatalog::new()),
            cluster: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share liveness of named endpoints through `cluster`
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterState>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateCatalog>) -> Self {
        self.templates = templates;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &Arc<TemplateCatalog> {
        &self.templates
    }

    pub fn cluster(&self) -> Option<&Arc<dyn ClusterState>> {
        self.cluster.as_ref()
    }
}

impl fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterContext")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("clock", &self.clock)
            .field("clustered", &self.cluster.is_some())
            .finish()
    }
}
