//! Request routing: knowledge-base short-circuit, scored provider
//! selection, bounded fallback and usage accounting.
//!
//! ```text
//! generate(req)
//!   ├─ KB search ── best.confidence ≥ threshold ──▶ source=internal
//!   ├─ rank AVAILABLE ∧ admitted providers (tier-aware)
//!   ├─ call top `max_attempts`, sequentially or racing under one deadline
//!   │     success ──▶ usage record ──▶ source=external
//!   └─ all failed ── any KB match? ──▶ source=internal_fallback
//!                                 └──▶ NoProvidersAvailable
//! ```

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::LlmBackend;
use crate::config::{FallbackMode, LlmConfig};
use crate::error::{LlmError, OrchestratorError};
use crate::knowledge::{KnowledgeMatch, KnowledgeSource};
use crate::metrics::LlmCounters;
use crate::prompt;
use crate::registry::{ProbeResult, ProviderRegistry};
use crate::selector::{self, Candidate};
use crate::types::{Completion, CompletionRequest, GenerateRequest, LlmReply, Source};
use crate::usage::{UsageLedger, UsageStats, UsageWindow};

/// Health and load of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    /// Provider name.
    pub name: String,
    /// AVAILABLE for routing.
    pub available: bool,
    /// Calls in the trailing window.
    pub current_usage: u32,
    /// Calls admitted per window.
    pub rate_limit: u32,
    /// Most recent probe.
    pub last_probe: Option<ProbeResult>,
}

/// A provider picked for one request.
struct Pick {
    name: String,
    backend: Arc<dyn LlmBackend>,
    cost_per_token: Decimal,
}

/// The LLM orchestrator. Construct once per process and share.
pub struct Orchestrator {
    config: LlmConfig,
    registry: ProviderRegistry,
    usage: Arc<UsageLedger>,
    knowledge: Arc<dyn KnowledgeSource>,
    counters: Arc<LlmCounters>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.registry.len())
            .field("mode", &self.config.fallback.mode)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        config: LlmConfig,
        registry: ProviderRegistry,
        usage: Arc<UsageLedger>,
        knowledge: Arc<dyn KnowledgeSource>,
    ) -> Self {
        info!(
            providers = registry.len(),
            mode = ?config.fallback.mode,
            max_attempts = config.fallback.max_attempts,
            "LLM orchestrator ready"
        );
        Self {
            config,
            registry,
            usage,
            knowledge,
            counters: Arc::new(LlmCounters::new()),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Routing counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<LlmCounters> {
        &self.counters
    }

    /// Registered providers.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Answer one request.
    ///
    /// # Errors
    /// [`OrchestratorError::NoProvidersAvailable`] when every candidate failed
    /// (or none was admitted) and the knowledge base had no match at all.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<LlmReply, OrchestratorError> {
        let matches = match self.knowledge.search(&request.prompt, self.config.kb.search_limit).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Knowledge search failed; routing to providers");
                Vec::new()
            }
        };
        let best = matches.into_iter().next();

        if let Some(hit) = best.as_ref().filter(|m| m.confidence >= self.config.kb.confidence_threshold) {
            LlmCounters::bump(&self.counters.kb_short_circuits);
            info!(
                user = %request.user_id,
                item = %hit.item.id,
                confidence = hit.confidence,
                "Answered from knowledge base"
            );
            return Ok(internal_reply(hit, Source::Internal));
        }

        let (picks, saturated) = self.pick(request);
        let call = prompt::compose(
            request.task_type,
            &request.context,
            &request.prompt,
            self.config.call.max_tokens,
            self.config.call.temperature,
            self.config.call.timeout_ms,
        );

        let outcome = match self.config.fallback.mode {
            FallbackMode::Sequential => self.call_sequential(&picks, &call).await,
            FallbackMode::Race => self.call_race(&picks, &call).await,
        };

        match outcome {
            Ok((pick, completion)) => Ok(self.external_reply(request, pick, completion)),
            Err(last_error) => {
                let last_error = last_error.or_else(|| {
                    saturated.then(|| "rate limit reached for every available provider".to_string())
                });
                if let Some(hit) = best {
                    LlmCounters::bump(&self.counters.internal_fallbacks);
                    warn!(
                        user = %request.user_id,
                        confidence = hit.confidence,
                        last_error = last_error.as_deref().unwrap_or("none"),
                        "All providers failed; answering from knowledge base"
                    );
                    return Ok(internal_reply(&hit, Source::InternalFallback));
                }
                LlmCounters::bump(&self.counters.exhausted);
                warn!(
                    user = %request.user_id,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "No LLM provider could answer"
                );
                Err(OrchestratorError::NoProvidersAvailable { last_error })
            }
        }
    }

    /// Ranked candidates for `request`, cut to `max_attempts`. The flag is
    /// set when some provider was available but none was admitted.
    fn pick(&self, request: &GenerateRequest) -> (Vec<Pick>, bool) {
        let entries = self.registry.entries();
        let candidates: Vec<Candidate<'_>> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_available())
            .map(|(index, e)| {
                let cfg = e.config();
                Candidate {
                    name: &cfg.name,
                    specialties: &cfg.specialties,
                    current_usage: self.usage.current_usage(&cfg.name),
                    rate_limit: cfg.rate_limit_per_minute,
                    cost_per_token: cfg.cost_per_token,
                    priority: cfg.priority,
                    index,
                }
            })
            .collect();
        let available = candidates.len();

        let ranked = selector::rank(candidates, request.task_type, request.user_tier, self.config.usage.rate_threshold);
        let saturated = available > 0 && ranked.is_empty();
        let picks: Vec<Pick> = ranked
            .into_iter()
            .take(self.config.fallback.max_attempts)
            .map(|c| {
                let entry = &entries[c.index];
                Pick {
                    name: entry.name().to_string(),
                    backend: Arc::clone(entry.backend()),
                    cost_per_token: entry.config().cost_per_token,
                }
            })
            .collect();
        debug!(
            tier = ?request.user_tier,
            task = %request.task_type,
            order = ?picks.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "Providers ranked"
        );
        (picks, saturated)
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.config.call.timeout_ms)
    }

    async fn call_sequential<'p>(
        &self,
        picks: &'p [Pick],
        call: &CompletionRequest,
    ) -> Result<(&'p Pick, Completion), Option<String>> {
        let mut last_error = None;
        for (attempt, pick) in picks.iter().enumerate() {
            if attempt > 0 {
                LlmCounters::bump(&self.counters.fallbacks);
                info!(provider = %pick.name, attempt = attempt + 1, "Falling back to next provider");
            }
            LlmCounters::bump(&self.counters.external_calls);
            let result = match tokio::time::timeout(self.deadline(), pick.backend.complete(call)).await {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout(self.config.call.timeout_ms)),
            };
            match result {
                Ok(completion) => return Ok((pick, completion)),
                Err(e) => {
                    self.note_failure(&pick.name, &e);
                    last_error = Some(format!("{}: {e}", pick.name));
                }
            }
        }
        Err(last_error)
    }

    async fn call_race<'p>(
        &self,
        picks: &'p [Pick],
        call: &CompletionRequest,
    ) -> Result<(&'p Pick, Completion), Option<String>> {
        if picks.is_empty() {
            return Err(None);
        }
        let mut set = JoinSet::new();
        for (idx, pick) in picks.iter().enumerate() {
            LlmCounters::bump(&self.counters.external_calls);
            let backend = Arc::clone(&pick.backend);
            let call = call.clone();
            set.spawn(async move { (idx, backend.complete(&call).await) });
        }

        let mut last_error = None;
        let raced = tokio::time::timeout(self.deadline(), async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, Ok(completion))) => return Some((idx, completion)),
                    Ok((idx, Err(e))) => {
                        self.note_failure(&picks[idx].name, &e);
                        last_error = Some(format!("{}: {e}", picks[idx].name));
                    }
                    Err(e) => {
                        warn!(error = %e, "Provider task aborted");
                        last_error = Some(format!("provider task aborted: {e}"));
                    }
                }
            }
            None
        })
        .await;

        match raced {
            Ok(Some((idx, completion))) => {
                debug!(provider = %picks[idx].name, "Race won");
                Ok((&picks[idx], completion))
            }
            Ok(None) => Err(last_error),
            Err(_) => {
                // Dropping the set aborts the stragglers.
                for _ in 0..set.len() {
                    LlmCounters::bump(&self.counters.provider_failures);
                }
                warn!(timeout_ms = self.config.call.timeout_ms, pending = set.len(), "Provider race timed out");
                Err(Some(format!("timed out after {}ms", self.config.call.timeout_ms)))
            }
        }
    }

    fn note_failure(&self, provider: &str, error: &LlmError) {
        LlmCounters::bump(&self.counters.provider_failures);
        warn!(provider, kind = error.kind(), transient = error.is_transient(), error = %error, "Provider call failed");
    }

    fn external_reply(&self, request: &GenerateRequest, pick: &Pick, completion: Completion) -> LlmReply {
        let cost = Decimal::from(completion.tokens_used) * pick.cost_per_token;
        self.usage
            .record(&request.user_id, &pick.name, request.task_type, completion.tokens_used, cost);
        info!(
            user = %request.user_id,
            provider = %pick.name,
            tokens = completion.tokens_used,
            cost = %cost,
            latency_ms = completion.latency_ms,
            "Provider answered"
        );
        LlmReply {
            response: completion.text,
            provider: Some(pick.name.clone()),
            source: Source::External,
            confidence: None,
            tokens_used: completion.tokens_used,
            cost,
        }
    }

    /// Probe every provider and return `(name, available)`.
    pub async fn probe_providers(&self) -> Vec<(String, bool)> {
        self.registry.probe_all().await
    }

    /// Health and load of every provider, in declaration order.
    #[must_use]
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry
            .entries()
            .iter()
            .map(|e| ProviderStatus {
                name: e.name().to_string(),
                available: e.is_available(),
                current_usage: self.usage.current_usage(e.name()),
                rate_limit: e.config().rate_limit_per_minute,
                last_probe: e.last_probe(),
            })
            .collect()
    }

    /// Calls to `provider` in the trailing rate window.
    #[must_use]
    pub fn current_usage(&self, provider: &str) -> u32 {
        self.usage.current_usage(provider)
    }

    /// Usage counters per provider and task type.
    ///
    /// # Errors
    /// [`LlmError::Store`] on query failure.
    pub async fn usage_stats(&self, user_id: Option<&str>, window: UsageWindow) -> Result<UsageStats, LlmError> {
        self.usage.stats(user_id, window).await
    }

    /// Wait until queued usage records are durable.
    pub async fn flush_usage(&self) {
        self.usage.flush().await;
    }

    /// The usage ledger.
    #[must_use]
    pub fn usage(&self) -> &Arc<UsageLedger> {
        &self.usage
    }
}

fn internal_reply(hit: &KnowledgeMatch, source: Source) -> LlmReply {
    LlmReply {
        response: hit.item.content.clone(),
        provider: None,
        source,
        confidence: Some(hit.confidence),
        tokens_used: 0,
        cost: Decimal::ZERO,
    }
}
