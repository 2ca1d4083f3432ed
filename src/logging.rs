//! Logging setup.
//!
//! All logs go to stderr so `tds-ta ask` and `tds-ta context` keep stdout
//! clean for their output.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, then `default_level`. With `json`,
/// events are emitted as one JSON object per line for log collectors.
pub fn init_logging(default_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow::anyhow!("Invalid log filter: {}", e))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))
}
