//! Endpoint definitions
//!
//! An [`EndpointDefinition`] is the static policy of a leaf: where to send,
//! how long to wait, and how to react to each error code. It is built once
//! and never mutated; replacing it means building a new leaf.

use conduit_types::codes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// What the transport does when the endpoint timeout expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Keep waiting
    #[default]
    Never,

    /// Drop the response silently
    Discard,

    /// Raise a fault on the message
    Fault,
}

/// A service described by a WSDL document.
///
/// WSDL parsing happens outside the router; by the time a descriptor reaches
/// a leaf the service port has already been resolved to `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Location of the WSDL document
    pub wsdl_uri: String,

    /// Service name within the document
    pub service: String,

    /// Port name within the service
    pub port: String,

    /// Address the port resolved to
    pub address: String,
}

/// Static policy of a leaf endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointDefinition {
    address: Option<String>,
    service: Option<ServiceDescriptor>,
    timeout_ms: Option<u64>,
    timeout_action: TimeoutAction,
    initial_suspend_ms: Option<u64>,
    suspend_progression_factor: f32,
    suspend_maximum_ms: Option<u64>,
    timeout_error_codes: BTreeSet<i32>,
    suspend_error_codes: BTreeSet<i32>,
    retries_on_timeout_before_suspend: u32,
    retry_delay_on_timeout_ms: u64,
    replicate_state: bool,
}

impl Default for EndpointDefinition {
    fn default() -> Self {
        Self {
            address: None,
            service: None,
            timeout_ms: None,
            timeout_action: TimeoutAction::Never,
            initial_suspend_ms: None,
            suspend_progression_factor: 1.0,
            suspend_maximum_ms: None,
            timeout_error_codes: BTreeSet::new(),
            suspend_error_codes: BTreeSet::new(),
            retries_on_timeout_before_suspend: 0,
            retry_delay_on_timeout_ms: 0,
            replicate_state: true,
        }
    }
}

impl EndpointDefinition {
    pub fn builder() -> EndpointDefinitionBuilder {
        EndpointDefinitionBuilder::default()
    }

    /// Definition with only an address and default policy
    pub fn for_address(address: impl Into<String>) -> Self {
        Self::builder().address(address).build()
    }

    /// Target address, falling back to the resolved service port
    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .or_else(|| self.service.as_ref().map(|s| s.address.as_str()))
    }

    pub fn service(&self) -> Option<&ServiceDescriptor> {
        self.service.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn timeout_action(&self) -> TimeoutAction {
        self.timeout_action
    }

    pub fn initial_suspend(&self) -> Option<Duration> {
        self.initial_suspend_ms.map(Duration::from_millis)
    }

    pub fn suspend_progression_factor(&self) -> f32 {
        self.suspend_progression_factor
    }

    pub fn suspend_maximum(&self) -> Option<Duration> {
        self.suspend_maximum_ms.map(Duration::from_millis)
    }

    pub fn timeout_error_codes(&self) -> &BTreeSet<i32> {
        &self.timeout_error_codes
    }

    pub fn suspend_error_codes(&self) -> &BTreeSet<i32> {
        &self.suspend_error_codes
    }

    pub fn retries_on_timeout_before_suspend(&self) -> u32 {
        self.retries_on_timeout_before_suspend
    }

    pub fn retry_delay_on_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_timeout_ms)
    }

    /// Whether liveness of this leaf is shared through the cluster state
    pub fn replicate_state(&self) -> bool {
        self.replicate_state
    }

    /// Whether `code` counts as a timeout.
    ///
    /// Without configured timeout codes only the transport's connection
    /// timeout and connection closed codes qualify.
    pub fn is_timeout_code(&self, code: i32) -> bool {
        if self.timeout_error_codes.is_empty() {
            codes::DEFAULT_TIMEOUT_CODES.contains(&code)
        } else {
            self.timeout_error_codes.contains(&code)
        }
    }

    /// Whether `code` must suspend the endpoint.
    ///
    /// Without configured suspend codes every error is fatal.
    pub fn is_suspend_code(&self, code: i32) -> bool {
        self.suspend_error_codes.is_empty() || self.suspend_error_codes.contains(&code)
    }

    /// Attach a resolved service descriptor, replacing any explicit address
    pub(crate) fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.address = None;
        self.service = Some(service);
        self
    }

    /// Copy of this policy pointing at `address`
    pub(crate) fn redirect(&self, address: &str) -> Self {
        let mut definition = self.clone();
        definition.address = Some(address.to_string());
        definition.service = None;
        definition
    }

    /// Copy with `$name` placeholders in the address replaced by `params`
    pub(crate) fn substitute(&self, params: &HashMap<String, String>) -> Self {
        let mut definition = self.clone();
        if let Some(address) = definition.address.as_mut() {
            *address = substitute_params(address, params);
        }
        if let Some(service) = definition.service.as_mut() {
            service.address = substitute_params(&service.address, params);
        }
        definition
    }
}

/// Replace every `$name` in `input` with its value from `params`.
///
/// Longer names are substituted first so `$host` never clobbers `$hostname`.
pub(crate) fn substitute_params(input: &str, params: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = params.keys().collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut output = input.to_string();
    for name in names {
        output = output.replace(&format!("${name}"), &params[name]);
    }
    output
}

/// Builder for [`EndpointDefinition`]
#[derive(Debug, Default)]
pub struct EndpointDefinitionBuilder {
    definition: EndpointDefinition,
}

impl EndpointDefinitionBuilder {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.definition.address = Some(address.into());
        self
    }

    pub fn service(mut self, service: ServiceDescriptor) -> Self {
        self.definition = self.definition.with_service(service);
        self
    }

    pub fn timeout(mut self, timeout: Duration, action: TimeoutAction) -> Self {
        self.definition.timeout_ms = Some(timeout.as_millis() as u64);
        self.definition.timeout_action = action;
        self
    }

    pub fn initial_suspend(mut self, duration: Duration) -> Self {
        self.definition.initial_suspend_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn progression_factor(mut self, factor: f32) -> Self {
        self.definition.suspend_progression_factor = factor;
        self
    }

    pub fn maximum_suspend(mut self, duration: Duration) -> Self {
        self.definition.suspend_maximum_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn timeout_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.definition.timeout_error_codes.extend(codes);
        self
    }

    pub fn suspend_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.definition.suspend_error_codes.extend(codes);
        self
    }

    pub fn retries_on_timeout(mut self, retries: u32, delay: Duration) -> Self {
        self.definition.retries_on_timeout_before_suspend = retries;
        self.definition.retry_delay_on_timeout_ms = delay.as_millis() as u64;
        self
    }

    pub fn replicate_state(mut self, replicate: bool) -> Self {
        self.definition.replicate_state = replicate;
        self
    }

    pub fn build(self) -> EndpointDefinition {
        self.definition
    }
}
