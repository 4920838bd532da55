//! Orchestrator configuration (`[llm]` in `fisioflow.toml`).
//!
//! API keys never live here: each provider names the environment variable
//! that holds its key.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::types::TaskType;

/// Top-level `[llm]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Declared providers, in priority order unless `priority` says otherwise.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Knowledge-base short-circuit.
    #[serde(default)]
    pub kb: KbConfig,
    /// Fallback chain.
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Per-call settings.
    #[serde(default)]
    pub call: CallConfig,
    /// Rate window and usage ledger.
    #[serde(default)]
    pub usage: UsageConfig,
}

impl LlmConfig {
    /// Parse and validate a TOML string holding the `[llm]` table's contents.
    ///
    /// # Errors
    /// [`LlmError::Config`] on malformed TOML or invalid values.
    pub fn from_toml(toml_str: &str) -> Result<Self, LlmError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| LlmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// [`LlmError::Config`] naming the first bad field.
    pub fn validate(&self) -> Result<(), LlmError> {
        if !(0.0..=1.0).contains(&self.kb.confidence_threshold) {
            return Err(LlmError::Config("llm.kb.confidence_threshold must be within [0, 1]".into()));
        }
        if self.fallback.max_attempts == 0 {
            return Err(LlmError::Config("llm.fallback.max_attempts must be at least 1".into()));
        }
        if self.call.timeout_ms == 0 {
            return Err(LlmError::Config("llm.call.timeout_ms must be positive".into()));
        }
        if self.usage.rate_window_secs == 0 {
            return Err(LlmError::Config("llm.usage.rate_window_secs must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if p.name.trim().is_empty() {
                return Err(LlmError::Config("provider name must not be empty".into()));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(LlmError::Config(format!("provider '{}' declared twice", p.name)));
            }
            if p.cost_per_token.is_sign_negative() {
                return Err(LlmError::Config(format!("provider '{}' has a negative cost_per_token", p.name)));
            }
        }
        Ok(())
    }
}

/// Wire protocol of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible `/v1/chat/completions`.
    Openai,
    /// Anthropic `/v1/messages`.
    Anthropic,
    /// Google Gemini `generateContent`.
    Gemini,
    /// Ollama `/api/generate` (no key required).
    Ollama,
}

/// One `[[llm.providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name used in usage records and replies.
    pub name: String,
    /// Wire protocol.
    pub kind: ProviderKind,
    /// API root, e.g. `https://api.openai.com`.
    #[serde(default)]
    pub base_url: String,
    /// Model identifier.
    #[serde(default)]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Disabled providers are never selected.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Calls admitted per rate window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Price of one token.
    #[serde(default)]
    pub cost_per_token: Decimal,
    /// Task types this provider is preferred for.
    #[serde(default)]
    pub specialties: Vec<TaskType>,
    /// Lower is preferred; breaks score ties and orders basic-tier picks.
    #[serde(default)]
    pub priority: u32,
}

impl ProviderConfig {
    /// A provider with defaults for everything but name and kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: String::new(),
            model: String::new(),
            api_key_env: None,
            enabled: true,
            rate_limit_per_minute: default_rate_limit(),
            cost_per_token: Decimal::ZERO,
            specialties: Vec::new(),
            priority: 0,
        }
    }
}

/// `[llm.kb]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbConfig {
    /// Minimum confidence for a short-circuit.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    /// Matches fetched per search.
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_threshold(),
            search_limit: default_search_limit(),
        }
    }
}

/// How the fallback chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// One provider at a time, best score first.
    #[default]
    Sequential,
    /// All candidates at once under one deadline; first success wins.
    Race,
}

/// `[llm.fallback]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Providers tried per request.
    #[serde(default = "default_attempts")]
    pub max_attempts: usize,
    /// Sequential or racing.
    #[serde(default)]
    pub mode: FallbackMode,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            mode: FallbackMode::Sequential,
        }
    }
}

/// `[llm.call]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Per-call deadline.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// `[llm.usage]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Trailing window for rate admission.
    #[serde(default = "default_window")]
    pub rate_window_secs: u64,
    /// Share of the rate limit under which a provider earns the headroom bonus.
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: default_window(),
            rate_threshold: default_rate_threshold(),
        }
    }
}

fn default_true() -> bool { true }
fn default_rate_limit() -> u32 { 60 }
fn default_threshold() -> f64 { 0.80 }
fn default_search_limit() -> usize { 5 }
fn default_attempts() -> usize { 3 }
fn default_timeout() -> u64 { 30_000 }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.7 }
fn default_window() -> u64 { 60 }
fn default_rate_threshold() -> f64 { 0.8 }
