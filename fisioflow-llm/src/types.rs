//! Request and reply types for the orchestrator and its backends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What the caller wants the model to do. Providers declare the task types
/// they specialise in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Anything else.
    General,
    /// Interpreting assessment data.
    Analysis,
    /// Clinical questions.
    Medical,
    /// Exercise prescription and progressions.
    Exercise,
    /// Literature and evidence lookups.
    Research,
    /// Drafting notes, reports and letters.
    Documentation,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::General,
        Self::Analysis,
        Self::Medical,
        Self::Exercise,
        Self::Research,
        Self::Documentation,
    ];

    /// Stable lowercase code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Analysis => "analysis",
            Self::Medical => "medical",
            Self::Exercise => "exercise",
            Self::Research => "research",
            Self::Documentation => "documentation",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// Caller's plan. Basic users always get the first available provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    /// Cost-bounded.
    #[default]
    Basic,
    /// Best-scoring provider.
    Premium,
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Knowledge base above the confidence threshold; no provider called.
    Internal,
    /// An external provider.
    External,
    /// Every provider failed; best knowledge-base match below threshold.
    InternalFallback,
}

impl Source {
    /// Stable lowercase code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::InternalFallback => "internal_fallback",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The user's prompt.
    pub prompt: String,
    /// Named scalars rendered as `key=value` lines ahead of the prompt.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Task classification.
    pub task_type: TaskType,
    /// Caller, for usage accounting.
    pub user_id: String,
    /// Caller's plan.
    #[serde(default)]
    pub user_tier: UserTier,
}

impl GenerateRequest {
    /// A request with empty context.
    #[must_use]
    pub fn new(prompt: impl Into<String>, task_type: TaskType, user_id: impl Into<String>, user_tier: UserTier) -> Self {
        Self {
            prompt: prompt.into(),
            context: BTreeMap::new(),
            task_type,
            user_id: user_id.into(),
            user_tier,
        }
    }

    /// Add one context line.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmReply {
    /// Generated or retrieved text.
    pub response: String,
    /// Provider name for external replies.
    pub provider: Option<String>,
    /// Origin of the text.
    pub source: Source,
    /// Knowledge-base confidence for internal replies.
    pub confidence: Option<f64>,
    /// Tokens billed; zero for internal replies.
    pub tokens_used: u32,
    /// `tokens_used * cost_per_token`.
    pub cost: Decimal,
}

/// A fully composed call to one backend.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// System preamble.
    pub system: String,
    /// Context lines and user prompt.
    pub user: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-call deadline in milliseconds.
    pub timeout_ms: u64,
}

/// A backend's answer.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Tokens billed (prompt plus completion when the provider reports both).
    pub tokens_used: u32,
    /// Wall time of the call.
    pub latency_ms: u64,
    /// Model that answered.
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_codes_round_trip() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>(), Ok(t));
        }
        assert_eq!("MEDICAL".parse::<TaskType>(), Ok(TaskType::Medical));
        assert!("astrology".parse::<TaskType>().is_err());
    }

    #[test]
    fn source_serializes_snake_case() {
        let json = serde_json::to_string(&Source::InternalFallback).expect("serialize");
        assert_eq!(json, "\"internal_fallback\"");
    }
}
