//! End-to-end routing tests with fake backends.
//!
//! Deadlines use real tokio time with short timeouts; the rate window runs
//! on a manual clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fisioflow_llm::{
    Completion, CompletionRequest, FallbackMode, GenerateRequest, KnowledgeInput, LlmBackend, LlmConfig, LlmError,
    Orchestrator, OrchestratorError, ProviderConfig, ProviderKind, ProviderRegistry, Source, SqliteKnowledgeBase,
    TaskType, UsageLedger, UsageWindow, UserTier,
};
use fisioflow_store::{Database, ManualClock, PersistenceConfig};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Clone, Copy)]
enum Behaviour {
    Reply(&'static str, u32),
    Hang,
    Status(u16),
}

struct Fake {
    name: String,
    behaviour: Behaviour,
    keyed: bool,
    calls: AtomicUsize,
    last_user: parking_lot::Mutex<Option<String>>,
}

impl Fake {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for Fake {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user.lock() = Some(request.user.clone());
        match self.behaviour {
            Behaviour::Reply(text, tokens) => Ok(Completion {
                text: text.to_string(),
                tokens_used: tokens,
                latency_ms: 1,
                model: "fake".into(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(LlmError::RequestFailed("unreachable".into()))
            }
            Behaviour::Status(status) => Err(LlmError::Http {
                status,
                body: "upstream error".into(),
            }),
        }
    }

    fn has_credentials(&self) -> bool {
        self.keyed
    }
}

struct Provider {
    name: &'static str,
    behaviour: Behaviour,
    specialties: Vec<TaskType>,
    cost: Decimal,
    priority: u32,
    rate_limit: u32,
    keyed: bool,
}

fn provider(name: &'static str, behaviour: Behaviour) -> Provider {
    Provider {
        name,
        behaviour,
        specialties: Vec::new(),
        cost: dec!(0.001),
        priority: 0,
        rate_limit: 60,
        keyed: true,
    }
}

struct Harness {
    orch: Orchestrator,
    kb: Arc<SqliteKnowledgeBase>,
    clock: Arc<ManualClock>,
    fakes: Vec<Arc<Fake>>,
}

impl Harness {
    fn fake(&self, name: &str) -> &Fake {
        self.fakes.iter().find(|f| f.name == name).expect("fake exists")
    }
}

fn config(mode: FallbackMode, timeout_ms: u64) -> LlmConfig {
    let mut config = LlmConfig::default();
    config.fallback.mode = mode;
    config.call.timeout_ms = timeout_ms;
    config
}

/// Must run inside a runtime so the usage writer starts.
fn harness(config: LlmConfig, providers: Vec<Provider>) -> Harness {
    let db = Arc::new(Database::open_in_memory(&PersistenceConfig::default()).expect("db"));
    let start = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).single().expect("valid");
    let clock = Arc::new(ManualClock::new(start));

    let mut registry = ProviderRegistry::new();
    let mut fakes = Vec::new();
    for p in providers {
        let fake = Arc::new(Fake {
            name: p.name.to_string(),
            behaviour: p.behaviour,
            keyed: p.keyed,
            calls: AtomicUsize::new(0),
            last_user: parking_lot::Mutex::new(None),
        });
        let mut cfg = ProviderConfig::new(p.name, ProviderKind::Openai);
        cfg.specialties = p.specialties;
        cfg.cost_per_token = p.cost;
        cfg.priority = p.priority;
        cfg.rate_limit_per_minute = p.rate_limit;
        registry.register(cfg, fake.clone());
        fakes.push(fake);
    }

    let usage = Arc::new(UsageLedger::new(Arc::clone(&db), clock.clone(), config.usage.rate_window_secs).expect("usage"));
    let kb = Arc::new(SqliteKnowledgeBase::new(db, clock.clone()).expect("kb"));
    let orch = Orchestrator::new(config, registry, usage, kb.clone());
    Harness { orch, kb, clock, fakes }
}

fn knowledge(title: &str, tags: &[&str], score: u8) -> KnowledgeInput {
    KnowledgeInput {
        title: title.into(),
        content: format!("Internal protocol: {title}"),
        category: "protocols".into(),
        tags: tags.iter().map(|t| (*t).to_string()).collect(),
        relevance_score: score,
    }
}

fn premium(prompt: &str, task: TaskType) -> GenerateRequest {
    GenerateRequest::new(prompt, task, "dr-ana", UserTier::Premium)
}

#[tokio::test]
async fn confident_knowledge_short_circuits_providers() {
    let h = harness(
        config(FallbackMode::Sequential, 500),
        vec![provider("a", Behaviour::Reply("from a", 10)), provider("b", Behaviour::Reply("from b", 10))],
    );
    h.kb.add(&knowledge("Knee osteoarthritis exercises", &["knee"], 90)).expect("add");

    let reply = h.orch.generate(&premium("knee", TaskType::Exercise)).await.expect("reply");
    assert_eq!(reply.source, Source::Internal);
    assert_eq!(reply.confidence, Some(0.9));
    assert_eq!(reply.provider, None);
    assert_eq!(reply.tokens_used, 0);
    assert_eq!(reply.cost, Decimal::ZERO);
    assert_eq!(reply.response, "Internal protocol: Knee osteoarthritis exercises");

    assert_eq!(h.fake("a").calls() + h.fake("b").calls(), 0);
    h.orch.flush_usage().await;
    assert!(h.orch.usage().records().expect("records").is_empty());
    assert_eq!(h.orch.counters().snapshot().kb_short_circuits, 1);
}

#[tokio::test]
async fn confidence_exactly_at_threshold_short_circuits() {
    let h = harness(config(FallbackMode::Sequential, 500), vec![provider("a", Behaviour::Reply("x", 1))]);
    h.kb.add(&knowledge("Ankle sprain", &["ankle"], 80)).expect("add");

    let reply = h.orch.generate(&premium("ankle", TaskType::Medical)).await.expect("reply");
    assert_eq!(reply.source, Source::Internal);
    assert_eq!(h.fake("a").calls(), 0);
}

#[tokio::test]
async fn timed_out_provider_falls_back_to_next() {
    let mut a = provider("a", Behaviour::Hang);
    a.specialties = vec![TaskType::Analysis];
    a.cost = dec!(0.0005);
    let mut b = provider("b", Behaviour::Reply("Gait looks asymmetric.", 120));
    b.cost = dec!(0.001);
    b.priority = 1;
    let h = harness(config(FallbackMode::Sequential, 50), vec![a, b]);

    let reply = h
        .orch
        .generate(&premium("Interpret this gait data", TaskType::Analysis))
        .await
        .expect("reply");
    assert_eq!(reply.source, Source::External);
    assert_eq!(reply.provider.as_deref(), Some("b"));
    assert_eq!(reply.tokens_used, 120);
    assert_eq!(reply.cost, dec!(0.120));
    assert_eq!(h.fake("a").calls(), 1);

    h.orch.flush_usage().await;
    let records = h.orch.usage().records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].provider, "b");
    assert_eq!(records[0].user_id, "dr-ana");
    assert_eq!(records[0].tokens_used, 120);
    assert_eq!(records[0].cost, dec!(0.120));
    assert_eq!(records[0].task_type, TaskType::Analysis);

    let counters = h.orch.counters().snapshot();
    assert_eq!(counters.external_calls, 2);
    assert_eq!(counters.provider_failures, 1);
    assert_eq!(counters.fallbacks, 1);
}

#[tokio::test]
async fn basic_tier_takes_first_provider_by_priority() {
    let mut specialist = provider("specialist", Behaviour::Reply("premium answer", 10));
    specialist.specialties = vec![TaskType::Exercise];
    specialist.priority = 1;
    let mut budget = provider("budget", Behaviour::Reply("budget answer", 10));
    budget.priority = 0;
    let h = harness(config(FallbackMode::Sequential, 500), vec![specialist, budget]);

    let basic = GenerateRequest::new("Plan a shoulder session", TaskType::Exercise, "rec-1", UserTier::Basic);
    let reply = h.orch.generate(&basic).await.expect("reply");
    assert_eq!(reply.provider.as_deref(), Some("budget"));

    let reply = h
        .orch
        .generate(&premium("Plan a shoulder session", TaskType::Exercise))
        .await
        .expect("reply");
    assert_eq!(reply.provider.as_deref(), Some("specialist"));
}

#[tokio::test]
async fn rate_limited_provider_is_skipped_until_window_passes() {
    let mut first = provider("first", Behaviour::Reply("one", 5));
    first.rate_limit = 1;
    let mut second = provider("second", Behaviour::Reply("two", 5));
    second.priority = 1;
    let h = harness(config(FallbackMode::Sequential, 500), vec![first, second]);
    let req = GenerateRequest::new("hello", TaskType::General, "u", UserTier::Basic);

    assert_eq!(h.orch.generate(&req).await.expect("reply").provider.as_deref(), Some("first"));
    assert_eq!(h.orch.current_usage("first"), 1);
    assert_eq!(h.orch.generate(&req).await.expect("reply").provider.as_deref(), Some("second"));

    h.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(h.orch.current_usage("first"), 0);
    assert_eq!(h.orch.generate(&req).await.expect("reply").provider.as_deref(), Some("first"));
}

#[tokio::test]
async fn every_provider_saturated_reports_rate_limit() {
    let mut only = provider("only", Behaviour::Reply("ok", 1));
    only.rate_limit = 1;
    let h = harness(config(FallbackMode::Sequential, 500), vec![only]);
    let req = GenerateRequest::new("hello", TaskType::General, "u", UserTier::Basic);

    h.orch.generate(&req).await.expect("first call admitted");
    let err = h.orch.generate(&req).await.expect_err("saturated");
    assert_eq!(err.kind(), "NO_PROVIDERS_AVAILABLE");
    assert!(err.to_string().contains("rate limit"));
}

#[tokio::test]
async fn race_mode_returns_first_success() {
    let mut slow = provider("slow", Behaviour::Hang);
    slow.specialties = vec![TaskType::Research];
    let fast = provider("fast", Behaviour::Reply("Evidence is moderate.", 40));
    let h = harness(config(FallbackMode::Race, 2_000), vec![slow, fast]);

    let reply = h
        .orch
        .generate(&premium("Is dry needling effective?", TaskType::Research))
        .await
        .expect("reply");
    assert_eq!(reply.provider.as_deref(), Some("fast"));
    assert_eq!(h.orch.counters().snapshot().external_calls, 2);
}

#[tokio::test]
async fn race_mode_times_out_as_a_whole() {
    let h = harness(
        config(FallbackMode::Race, 50),
        vec![provider("a", Behaviour::Hang), provider("b", Behaviour::Hang)],
    );
    let err = h
        .orch
        .generate(&premium("anything", TaskType::General))
        .await
        .expect_err("deadline");
    match err {
        OrchestratorError::NoProvidersAvailable { last_error } => {
            assert!(last_error.expect("has error").contains("timed out"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn weak_knowledge_answers_when_every_provider_fails() {
    let h = harness(
        config(FallbackMode::Sequential, 500),
        vec![provider("a", Behaviour::Status(503)), provider("b", Behaviour::Status(429))],
    );
    h.kb.add(&knowledge("Hip replacement rehab", &["hip"], 40)).expect("add");

    let reply = h
        .orch
        .generate(&premium("hip replacement", TaskType::Medical))
        .await
        .expect("reply");
    assert_eq!(reply.source, Source::InternalFallback);
    assert_eq!(reply.confidence, Some(0.4));
    assert_eq!(h.fake("a").calls(), 1);
    assert_eq!(h.fake("b").calls(), 1);
    assert_eq!(h.orch.counters().snapshot().internal_fallbacks, 1);
}

#[tokio::test]
async fn exhaustion_surfaces_last_error_and_respects_max_attempts() {
    let mut config = config(FallbackMode::Sequential, 500);
    config.fallback.max_attempts = 2;
    let mut a = provider("a", Behaviour::Status(500));
    a.priority = 0;
    let mut b = provider("b", Behaviour::Status(502));
    b.priority = 1;
    let mut c = provider("c", Behaviour::Reply("never asked", 1));
    c.priority = 2;
    let h = harness(config, vec![a, b, c]);

    let req = GenerateRequest::new("hello", TaskType::General, "u", UserTier::Basic);
    let err = h.orch.generate(&req).await.expect_err("exhausted");
    match err {
        OrchestratorError::NoProvidersAvailable { last_error } => {
            let last = last_error.expect("has error");
            assert!(last.starts_with("b:"), "{last}");
            assert!(last.contains("502"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.fake("c").calls(), 0);
    assert_eq!(h.orch.counters().snapshot().exhausted, 1);
}

#[tokio::test]
async fn no_registered_provider_and_no_knowledge() {
    let h = harness(config(FallbackMode::Sequential, 500), Vec::new());
    let err = h
        .orch
        .generate(&premium("hello", TaskType::General))
        .await
        .expect_err("nothing to route to");
    assert!(matches!(err, OrchestratorError::NoProvidersAvailable { last_error: None }));
}

#[tokio::test]
async fn providers_without_credentials_are_never_called() {
    let mut keyless = provider("keyless", Behaviour::Reply("x", 1));
    keyless.keyed = false;
    keyless.specialties = vec![TaskType::General];
    let h = harness(
        config(FallbackMode::Sequential, 500),
        vec![keyless, provider("keyed", Behaviour::Reply("y", 1))],
    );

    let reply = h.orch.generate(&premium("hello", TaskType::General)).await.expect("reply");
    assert_eq!(reply.provider.as_deref(), Some("keyed"));
    assert_eq!(h.fake("keyless").calls(), 0);

    let status = h.orch.provider_status();
    assert_eq!(status.len(), 2);
    assert!(!status[0].available);
    assert!(status[1].available);
    assert_eq!(status[1].current_usage, 1);
}

#[tokio::test]
async fn composed_prompt_carries_context_lines() {
    let h = harness(config(FallbackMode::Sequential, 500), vec![provider("a", Behaviour::Reply("ok", 3))]);
    let req = premium("Suggest next steps", TaskType::Exercise)
        .with_context("pain", 4)
        .with_context("week", 3);
    h.orch.generate(&req).await.expect("reply");
    let sent = h.fake("a").last_user.lock().clone().expect("called");
    assert_eq!(sent, "pain=4\nweek=3\n\nSuggest next steps");
}

#[tokio::test]
async fn usage_stats_group_by_provider_and_task() {
    let mut a = provider("a", Behaviour::Reply("ok", 100));
    a.cost = dec!(0.002);
    let h = harness(config(FallbackMode::Sequential, 500), vec![a]);

    for task in [TaskType::Exercise, TaskType::Exercise, TaskType::Documentation] {
        h.orch.generate(&premium("write", task)).await.expect("reply");
    }
    let other = GenerateRequest::new("write", TaskType::General, "someone-else", UserTier::Basic);
    h.orch.generate(&other).await.expect("reply");

    let mine = h.orch.usage_stats(Some("dr-ana"), UsageWindow::Day).await.expect("stats");
    assert_eq!(mine.total.calls, 3);
    assert_eq!(mine.total.tokens, 300);
    assert_eq!(mine.total.cost, dec!(0.600));
    assert_eq!(mine.by_task[&TaskType::Exercise].calls, 2);
    assert_eq!(mine.by_task[&TaskType::Documentation].calls, 1);
    assert_eq!(mine.by_provider["a"].calls, 3);

    let all = h.orch.usage_stats(None, UsageWindow::Month).await.expect("stats");
    assert_eq!(all.total.calls, 4);
}
