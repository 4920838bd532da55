//! Host-level errors. Component errors pass through unchanged.

use std::path::PathBuf;

use fisioflow_core::FisioError;
use fisioflow_llm::{LlmError, OrchestratorError};
use fisioflow_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the host.
#[derive(Debug, Error)]
pub enum HostError {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading a file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Voucher and settlement core.
    #[error(transparent)]
    Core(#[from] FisioError),

    /// LLM component.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// LLM routing.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Database.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Telemetry could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl HostError {
    /// Stable identifier of the underlying error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Io { .. } => "IO",
            Self::Core(e) => e.kind().as_str(),
            Self::Llm(e) => e.kind(),
            Self::Orchestrator(e) => e.kind(),
            Self::Store(_) => "STORAGE",
            Self::Telemetry(_) => "TELEMETRY",
        }
    }
}

/// Result alias for the host.
pub type Result<T> = std::result::Result<T, HostError>;
