//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::{GeneralConfig, LogFormat};
use crate::error::{HostError, Result};

/// Install the global subscriber: `RUST_LOG` when set, otherwise the
/// configured level. Returns `false` if a subscriber was already installed,
/// which is not an error (tests install one per process).
///
/// # Errors
/// [`HostError::Telemetry`] if the configured level is not a valid filter.
pub fn init(config: &GeneralConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| HostError::Telemetry(e.to_string()))?,
    };

    let installed = match config.log_format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
    }
    .is_ok();

    if installed {
        tracing::debug!(level = %config.log_level, format = ?config.log_format, "Telemetry initialised");
    }
    Ok(installed)
}
