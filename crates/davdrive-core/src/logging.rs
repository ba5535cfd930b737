//! Tracing subscriber initialisation.
//!
//! Hosts that embed the driver call [`init_tracing`] once at startup.
//! `RUST_LOG` wins over the configured level so a single run can be made
//! more verbose without editing the configuration file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Builds the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Installs the global `tracing` subscriber.
///
/// Returns `false` if a subscriber was already installed, which happens
/// when several mounts share one process.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = env_filter(config);

    let result = if config.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };

    result.is_ok()
}
