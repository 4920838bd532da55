//! Orchestrator counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for routing events.
#[derive(Debug, Default)]
pub struct LlmCounters {
    /// Requests answered from the knowledge base above threshold.
    pub kb_short_circuits: AtomicU64,
    /// Provider calls attempted.
    pub external_calls: AtomicU64,
    /// Provider calls that failed or timed out.
    pub provider_failures: AtomicU64,
    /// Moves to the next provider after a failure.
    pub fallbacks: AtomicU64,
    /// Requests answered from a below-threshold match after every provider failed.
    pub internal_fallbacks: AtomicU64,
    /// Requests that ended in `NoProvidersAvailable`.
    pub exhausted: AtomicU64,
}

impl LlmCounters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> LlmCounterSnapshot {
        LlmCounterSnapshot {
            kb_short_circuits: self.kb_short_circuits.load(Ordering::Relaxed),
            external_calls: self.external_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            internal_fallbacks: self.internal_fallbacks.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct LlmCounterSnapshot {
    pub kb_short_circuits: u64,
    pub external_calls: u64,
    pub provider_failures: u64,
    pub fallbacks: u64,
    pub internal_fallbacks: u64,
    pub exhausted: u64,
}

impl LlmCounterSnapshot {
    /// Prometheus text exposition.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows = [
            ("fisioflow_llm_kb_short_circuits_total", "Requests answered from the knowledge base", self.kb_short_circuits),
            ("fisioflow_llm_external_calls_total", "Provider calls attempted", self.external_calls),
            ("fisioflow_llm_provider_failures_total", "Provider calls that failed", self.provider_failures),
            ("fisioflow_llm_fallbacks_total", "Fallbacks to the next provider", self.fallbacks),
            ("fisioflow_llm_internal_fallbacks_total", "Below-threshold knowledge answers after provider exhaustion", self.internal_fallbacks),
            ("fisioflow_llm_exhausted_total", "Requests with no provider available", self.exhausted),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_counter() {
        let c = LlmCounters::new();
        LlmCounters::bump(&c.fallbacks);
        LlmCounters::bump(&c.fallbacks);
        let text = c.snapshot().to_prometheus();
        assert!(text.contains("fisioflow_llm_fallbacks_total 2\n"));
        assert_eq!(text.matches("# TYPE").count(), 6);
    }
}
