//! Provider registry and health.
//!
//! A provider is AVAILABLE when it is enabled, holds credentials, and its
//! last health probe did not fail. Call failures during `generate` do not
//! change health; only [`ProviderRegistry::probe_all`] does.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::LlmBackend;
use crate::client::HttpBackend;
use crate::config::ProviderConfig;
use crate::error::LlmError;

/// Result of the most recent probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Whether the probe succeeded.
    pub ok: bool,
    /// Failure message.
    pub error: Option<String>,
    /// When the probe ran.
    pub at: DateTime<Utc>,
}

/// A registered provider.
pub struct ProviderEntry {
    config: ProviderConfig,
    backend: Arc<dyn LlmBackend>,
    last_probe: RwLock<Option<ProbeResult>>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.config.name)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    /// Declared configuration.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The backend that serves calls.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Enabled, credentialed and not failing its last probe.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.config.enabled
            && self.backend.has_credentials()
            && self.last_probe.read().as_ref().is_none_or(|p| p.ok)
    }

    /// Most recent probe, if any.
    #[must_use]
    pub fn last_probe(&self) -> Option<ProbeResult> {
        self.last_probe.read().clone()
    }

    fn record_probe(&self, result: Result<(), LlmError>) {
        let probe = ProbeResult {
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            at: Utc::now(),
        };
        *self.last_probe.write() = Some(probe);
    }
}

/// Every provider known to the orchestrator, in declaration order.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`HttpBackend`] per configured provider.
    #[must_use]
    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config.clone(), Arc::new(HttpBackend::from_config(config)));
        }
        registry
    }

    /// Add a provider with an explicit backend.
    pub fn register(&mut self, config: ProviderConfig, backend: Arc<dyn LlmBackend>) {
        if !backend.has_credentials() {
            warn!(provider = %config.name, "Provider registered without credentials");
        }
        self.entries.push(ProviderEntry {
            config,
            backend,
            last_probe: RwLock::new(None),
        });
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    /// Entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Entries currently AVAILABLE.
    pub fn available(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.iter().filter(|e| e.is_available())
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe every enabled provider concurrently and record the outcome.
    /// Returns `(name, available)` in declaration order.
    pub async fn probe_all(&self) -> Vec<(String, bool)> {
        let probes = self.entries.iter().filter(|e| e.config.enabled).map(|e| async move {
            let result = e.backend.probe().await;
            if let Err(err) = &result {
                warn!(provider = %e.name(), error = %err, "Provider probe failed");
            }
            e.record_probe(result);
        });
        join_all(probes).await;

        let health: Vec<(String, bool)> = self
            .entries
            .iter()
            .map(|e| (e.name().to_string(), e.is_available()))
            .collect();
        info!(
            available = health.iter().filter(|(_, ok)| *ok).count(),
            total = health.len(),
            "Provider probe complete"
        );
        health
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::ProviderKind;
    use crate::types::{Completion, CompletionRequest};

    struct Probe {
        name: &'static str,
        up: bool,
        keyed: bool,
    }

    #[async_trait]
    impl LlmBackend for Probe {
        fn name(&self) -> &str {
            self.name
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Err(LlmError::Unavailable("not used".into()))
        }
        async fn probe(&self) -> Result<(), LlmError> {
            if self.up { Ok(()) } else { Err(LlmError::Unavailable("down".into())) }
        }
        fn has_credentials(&self) -> bool {
            self.keyed
        }
    }

    fn registry() -> ProviderRegistry {
        let mut r = ProviderRegistry::new();
        for (name, up, keyed) in [("a", true, true), ("b", false, true), ("c", true, false)] {
            r.register(ProviderConfig::new(name, ProviderKind::Openai), Arc::new(Probe { name, up, keyed }));
        }
        let mut disabled = ProviderConfig::new("d", ProviderKind::Ollama);
        disabled.enabled = false;
        r.register(disabled, Arc::new(Probe { name: "d", up: true, keyed: true }));
        r
    }

    #[tokio::test]
    async fn probe_marks_failing_providers_unavailable() {
        let r = registry();
        let before: Vec<&str> = r.available().map(ProviderEntry::name).collect();
        assert_eq!(before, vec!["a", "b"]);

        let health = r.probe_all().await;
        assert_eq!(
            health,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), false),
                ("d".to_string(), false),
            ]
        );
        assert!(r.get("b").and_then(ProviderEntry::last_probe).is_some_and(|p| !p.ok));
        assert!(r.get("d").and_then(ProviderEntry::last_probe).is_none());
    }
}
