//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Suspension applied to a leaf whose definition has no initial suspend
/// duration.
///
/// One policy for every leaf kind; it is never chosen per endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSuspend {
    /// Suspend until explicitly reactivated
    Forever,

    /// Suspend for a fixed duration, then back off geometrically as configured
    Bounded { millis: u64 },
}

impl DefaultSuspend {
    /// Initial suspend duration implied by this policy
    pub fn initial(&self) -> Option<Duration> {
        match self {
            DefaultSuspend::Forever => None,
            DefaultSuspend::Bounded { millis } => Some(Duration::from_millis(*millis)),
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("never") || raw.eq_ignore_ascii_case("forever") {
            return Some(DefaultSuspend::Forever);
        }
        raw.parse().ok().map(|millis| DefaultSuspend::Bounded { millis })
    }
}

impl Default for DefaultSuspend {
    fn default() -> Self {
        DefaultSuspend::Forever
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Capacity of each recipient list's dynamic endpoint pool
    pub dynamic_pool_size: usize,

    /// Maximum number of bound sessions per session-affinity endpoint
    pub session_table_capacity: usize,

    /// Idle time after which a session binding expires (0 disables expiry)
    pub session_timeout_ms: u64,

    /// Suspension for leaves without an explicit suspend duration
    pub default_suspend: DefaultSuspend,

    /// Log filter directive
    pub log_level: String,
}

impl RouterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let dynamic_pool_size = std::env::var("CONDUIT_DYNAMIC_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.dynamic_pool_size);

        let session_table_capacity = std::env::var("CONDUIT_SESSION_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.session_table_capacity);

        let session_timeout_ms = std::env::var("CONDUIT_SESSION_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.session_timeout_ms);

        let default_suspend = std::env::var("CONDUIT_DEFAULT_SUSPEND_MS")
            .ok()
            .and_then(|s| DefaultSuspend::parse(&s))
            .unwrap_or(defaults.default_suspend);

        let log_level = std::env::var("RUST_LOG").unwrap_or(defaults.log_level);

        Self {
            dynamic_pool_size,
            session_table_capacity,
            session_timeout_ms,
            default_suspend,
            log_level,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dynamic_pool_size == 0 {
            anyhow::bail!("Dynamic endpoint pool size must be greater than zero");
        }
        if self.session_table_capacity == 0 {
            anyhow::bail!("Session table capacity must be greater than zero");
        }
        if let DefaultSuspend::Bounded { millis: 0 } = self.default_suspend {
            anyhow::bail!("Bounded default suspension needs a non-zero duration");
        }
        Ok(())
    }

    /// Session idle timeout, `None` when sessions never expire
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dynamic_pool_size: 20,
            session_table_capacity: 10_000,
            session_timeout_ms: 120_000,
            default_suspend: DefaultSuspend::Forever,
            log_level: "info".to_string(),
        }
    }
}
