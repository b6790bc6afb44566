//! Tracing subscriber setup

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global fmt subscriber. `RUST_LOG` wins over `logging.filter`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.filter)
            .with_context(|| format!("Invalid log filter {:?}", cfg.filter))?,
    };

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
