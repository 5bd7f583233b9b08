//! Declarative endpoint descriptions
//!
//! A blueprint is the object model a configuration loader produces. It can
//! be deserialized from JSON and turned into live nodes with
//! [`EndpointTree::build`](crate::EndpointTree::build); templates use the
//! same model for their bodies.
//!
//! ```json
//! {
//!   "type": "load_balance",
//!   "name": "quotes",
//!   "algorithm": { "kind": "round_robin" },
//!   "children": [
//!     { "type": "address", "name": "q1", "definition": { "address": "http://q1/quote" } },
//!     { "type": "address", "name": "q2", "definition": { "address": "http://q2/quote" } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::algorithm::AlgorithmKind;
use crate::definition::{substitute_params, EndpointDefinition, ServiceDescriptor};
use crate::endpoint::RecipientSource;
use crate::error::{Result, RouteError};
use crate::session::DispatcherKind;

fn default_failover() -> bool {
    true
}

/// Description of one endpoint and, for composites, its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointBlueprint {
    Address {
        #[serde(default)]
        name: Option<String>,
        definition: EndpointDefinition,
    },

    Wsdl {
        #[serde(default)]
        name: Option<String>,
        service: ServiceDescriptor,
        #[serde(default)]
        definition: EndpointDefinition,
    },

    Default {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        definition: EndpointDefinition,
    },

    Indirect {
        #[serde(default)]
        name: Option<String>,
        key: String,
    },

    Template {
        #[serde(default)]
        name: Option<String>,
        template: String,
        #[serde(default)]
        parameters: HashMap<String, String>,
    },

    LoadBalance {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        algorithm: AlgorithmKind,
        #[serde(default = "default_failover")]
        failover: bool,
        children: Vec<EndpointBlueprint>,
    },

    SessionAffinity {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        algorithm: AlgorithmKind,
        #[serde(default)]
        dispatcher: DispatcherKind,
        children: Vec<EndpointBlueprint>,
    },

    RecipientList {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        children: Vec<EndpointBlueprint>,
        #[serde(default)]
        members: Vec<String>,
        #[serde(default)]
        recipients: Option<RecipientSource>,
        #[serde(default)]
        pool_size: Option<usize>,
    },
}

impl EndpointBlueprint {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RouteError::InvalidBlueprint(e.to_string()))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EndpointBlueprint::Address { name, .. }
            | EndpointBlueprint::Wsdl { name, .. }
            | EndpointBlueprint::Default { name, .. }
            | EndpointBlueprint::Indirect { name, .. }
            | EndpointBlueprint::Template { name, .. }
            | EndpointBlueprint::LoadBalance { name, .. }
            | EndpointBlueprint::SessionAffinity { name, .. }
            | EndpointBlueprint::RecipientList { name, .. } => name.as_deref(),
        }
    }

    /// Copy with `$name` placeholders replaced in names, addresses, keys
    /// and recipient lists
    pub fn substitute(&self, params: &HashMap<String, String>) -> Self {
        let sub = |value: &str| substitute_params(value, params);
        let sub_name = |name: &Option<String>| name.as_deref().map(sub);
        let sub_children = |children: &[EndpointBlueprint]| -> Vec<EndpointBlueprint> {
            children.iter().map(|c| c.substitute(params)).collect()
        };

        match self {
            EndpointBlueprint::Address { name, definition } => EndpointBlueprint::Address {
                name: sub_name(name),
                definition: definition.substitute(params),
            },
            EndpointBlueprint::Wsdl {
                name,
                service,
                definition,
            } => EndpointBlueprint::Wsdl {
                name: sub_name(name),
                service: ServiceDescriptor {
                    wsdl_uri: sub(&service.wsdl_uri),
                    service: service.service.clone(),
                    port: service.port.clone(),
                    address: sub(&service.address),
                },
                definition: definition.substitute(params),
            },
            EndpointBlueprint::Default { name, definition } => EndpointBlueprint::Default {
                name: sub_name(name),
                definition: definition.clone(),
            },
            EndpointBlueprint::Indirect { name, key } => EndpointBlueprint::Indirect {
                name: sub_name(name),
                key: sub(key),
            },
            EndpointBlueprint::Template {
                name,
                template,
                parameters,
            } => EndpointBlueprint::Template {
                name: sub_name(name),
                template: template.clone(),
                parameters: parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), sub(v)))
                    .collect(),
            },
            EndpointBlueprint::LoadBalance {
                name,
                algorithm,
                failover,
                children,
            } => EndpointBlueprint::LoadBalance {
                name: sub_name(name),
                algorithm: algorithm.clone(),
                failover: *failover,
                children: sub_children(children),
            },
            EndpointBlueprint::SessionAffinity {
                name,
                algorithm,
                dispatcher,
                children,
            } => EndpointBlueprint::SessionAffinity {
                name: sub_name(name),
                algorithm: algorithm.clone(),
                dispatcher: dispatcher.clone(),
                children: sub_children(children),
            },
            EndpointBlueprint::RecipientList {
                name,
                children,
                members,
                recipients,
                pool_size,
            } => EndpointBlueprint::RecipientList {
                name: sub_name(name),
                children: sub_children(children),
                members: members.iter().map(|m| sub(m)).collect(),
                recipients: recipients.as_ref().map(|source| match source {
                    RecipientSource::Literal(list) => RecipientSource::Literal(sub(list)),
                    RecipientSource::Property(key) => RecipientSource::Property(key.clone()),
                }),
                pool_size: *pool_size,
            },
        }
    }
}

/// Named, parameterized blueprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,

    /// Parameters every instance must supply
    #[serde(default)]
    pub parameters: Vec<String>,

    pub body: EndpointBlueprint,
}

impl TemplateDefinition {
    pub fn new(name: impl Into<String>, parameters: Vec<String>, body: EndpointBlueprint) -> Self {
        Self {
            name: name.into(),
            parameters,
            body,
        }
    }

    /// Body with `params` substituted; fails if a declared parameter is missing
    pub fn instantiate(&self, params: &HashMap<String, String>) -> Result<EndpointBlueprint> {
        let missing: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| !params.contains_key(*p))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(RouteError::InvalidBlueprint(format!(
                "template '{}' is missing parameters: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(self.body.substitute(params))
    }
}
