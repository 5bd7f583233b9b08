//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::RouterConfig;

/// Install a global fmt subscriber filtered by `config.log_level`.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_logging(config: &RouterConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
