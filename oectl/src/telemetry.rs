//! Tracing initialization.
//!
//! Sets up tracing-subscriber with an `EnvFilter` and a fmt layer. `RUST_LOG`
//! takes precedence over the configured level; the configured format selects
//! between human-readable and JSON output.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

/// Initialize tracing from the logging configuration.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_telemetry(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    tracing::info!("Telemetry initialized");
    Ok(())
}
