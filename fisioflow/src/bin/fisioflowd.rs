//! FisioFlow daemon: loads `fisioflow.toml`, starts the host and the
//! settlement scheduler, and runs until Ctrl-C.
//!
//! Usage: `fisioflowd [CONFIG]` (default `fisioflow.toml`; a missing file
//! means all defaults).

use std::path::PathBuf;

use anyhow::Context;
use fisioflow::{FisioConfig, FisioFlow, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from("fisioflow.toml"), PathBuf::from);

    let config = if path.exists() {
        FisioConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?
    } else {
        FisioConfig::default()
    };
    telemetry::init(&config.general).context("initialising telemetry")?;
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found; using defaults");
    }

    let host = FisioFlow::new(config).context("starting FisioFlow")?;
    for (provider, available) in host.llm().probe_providers().await {
        info!(%provider, available, "Provider health");
    }
    if host.start_scheduler().await {
        info!(
            interval_secs = host.config().core.settlement.schedule_interval_secs,
            "Settlement scheduler running"
        );
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    host.shutdown().await.context("shutting down")?;
    Ok(())
}
