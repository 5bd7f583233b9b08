//! Session key extraction

use conduit_types::Message;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Finds the session a message belongs to
pub trait SessionDispatcher: Send + Sync + Debug {
    /// Session key carried by an outbound request
    fn session_key(&self, message: &Message) -> Option<String>;

    /// Session key announced by a response
    fn response_session_key(&self, response: &Message) -> Option<String> {
        self.session_key(response)
    }

    /// Whether the server creates the session, so binding waits for its response
    fn is_server_initiated(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Client-chosen session id in the `ClientID` header
#[derive(Debug, Clone)]
pub struct ClientIdDispatcher {
    header: String,
}

impl ClientIdDispatcher {
    pub const DEFAULT_HEADER: &'static str = "ClientID";

    pub fn new() -> Self {
        Self::with_header(Self::DEFAULT_HEADER)
    }

    pub fn with_header(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for ClientIdDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDispatcher for ClientIdDispatcher {
    fn session_key(&self, message: &Message) -> Option<String> {
        non_empty(message.header(&self.header))
    }

    fn is_server_initiated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "client_id"
    }
}

/// HTTP cookie session: requests carry it in `Cookie`, responses set it
/// through `Set-Cookie`
#[derive(Debug, Clone)]
pub struct HttpCookieDispatcher {
    cookie: String,
}

impl HttpCookieDispatcher {
    pub const DEFAULT_COOKIE: &'static str = "JSESSIONID";

    pub fn new() -> Self {
        Self::with_cookie(Self::DEFAULT_COOKIE)
    }

    pub fn with_cookie(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    fn find_cookie(&self, header: Option<&str>) -> Option<String> {
        header?
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.trim() == self.cookie)
            .and_then(|(_, value)| non_empty(Some(value.trim())))
    }
}

impl Default for HttpCookieDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDispatcher for HttpCookieDispatcher {
    fn session_key(&self, message: &Message) -> Option<String> {
        self.find_cookie(message.header("Cookie"))
    }

    fn response_session_key(&self, response: &Message) -> Option<String> {
        self.find_cookie(response.header("Set-Cookie"))
    }

    fn is_server_initiated(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "http_cookie"
    }
}

/// SOAP service-group session in the `ServiceGroupId` header
#[derive(Debug, Clone, Default)]
pub struct SoapSessionDispatcher;

impl SoapSessionDispatcher {
    pub const HEADER: &'static str = "ServiceGroupId";
}

impl SessionDispatcher for SoapSessionDispatcher {
    fn session_key(&self, message: &Message) -> Option<String> {
        non_empty(message.header(Self::HEADER))
    }

    fn is_server_initiated(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "soap_session"
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Declarative dispatcher selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatcherKind {
    ClientId {
        #[serde(default)]
        header: Option<String>,
    },

    #[default]
    HttpCookie,

    SoapSession,
}

impl DispatcherKind {
    pub fn build(&self) -> Arc<dyn SessionDispatcher> {
        match self {
            DispatcherKind::ClientId { header: Some(header) } => {
                Arc::new(ClientIdDispatcher::with_header(header.clone()))
            }
            DispatcherKind::ClientId { header: None } => Arc::new(ClientIdDispatcher::new()),
            DispatcherKind::HttpCookie => Arc::new(HttpCookieDispatcher::new()),
            DispatcherKind::SoapSession => Arc::new(SoapSessionDispatcher),
        }
    }
}
