//! `fisioflow.toml`: one file for the whole process.
//!
//! ```toml
//! [general]
//! log_level = "info"
//! log_format = "json"
//!
//! [persistence]
//! path = "/var/lib/fisioflow/fisioflow.db"
//!
//! [settlement]
//! maturation_policy = "after_days"
//! maturation_days = 7
//!
//! [[llm.providers]]
//! name = "gpt"
//! kind = "openai"
//! base_url = "https://api.openai.com"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! ```
//!
//! The `[voucher]`, `[settlement]` and `[withdrawal]` sections belong to the
//! voucher core; `[llm]` belongs to the orchestrator. Every key has a
//! default, so an empty file is a valid configuration.

use std::path::Path;

use fisioflow_core::CoreConfig;
use fisioflow_llm::LlmConfig;
use fisioflow_store::PersistenceConfig;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

/// Complete process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FisioConfig {
    /// Logging.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Database.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Voucher, settlement and withdrawal rules.
    #[serde(flatten)]
    pub core: CoreConfig,
    /// LLM orchestration.
    #[serde(default)]
    pub llm: LlmConfig,
}

impl FisioConfig {
    /// Parse and validate TOML.
    ///
    /// # Errors
    /// [`HostError::Config`] on malformed TOML or invalid values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| HostError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a file.
    ///
    /// # Errors
    /// [`HostError::Io`] if the file cannot be read, otherwise as
    /// [`FisioConfig::from_toml`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| HostError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Validate every section.
    ///
    /// # Errors
    /// [`HostError::Config`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.core.validate().map_err(|e| HostError::Config(e.to_string()))?;
        self.llm.validate().map_err(|e| HostError::Config(e.to_string()))?;
        if self.persistence.busy_timeout_ms == 0 {
            return Err(HostError::Config("persistence.busy_timeout_ms must be positive".into()));
        }
        if self.general.log_level.trim().is_empty() {
            return Err(HostError::Config("general.log_level must not be empty".into()));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// `[general]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
