//! # fisioflow-llm
//!
//! Multi-provider LLM orchestration for FisioFlow.
//!
//! Every assistant request goes through [`Orchestrator::generate`]:
//!   - answered from the internal knowledge base when a curated item is
//!     confident enough, with no provider call at all;
//!   - otherwise routed to the best AVAILABLE provider (specialty, rate
//!     headroom, price), with basic-tier users pinned to the first provider
//!     by priority to bound cost;
//!   - each call bounded by a timeout, failures falling through to the next
//!     provider up to `max_attempts`;
//!   - successful calls recorded in an append-only usage ledger written off
//!     the caller's path.
//!
//! Backends speak OpenAI-compatible, Anthropic, Gemini and Ollama HTTP APIs
//! through [`client::HttpBackend`]; tests substitute any [`LlmBackend`].

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod selector;
pub mod types;
pub mod usage;

pub use backend::LlmBackend;
pub use client::HttpBackend;
pub use config::{FallbackMode, LlmConfig, ProviderConfig, ProviderKind};
pub use error::{LlmError, OrchestratorError};
pub use knowledge::{KnowledgeInput, KnowledgeItem, KnowledgeMatch, KnowledgeSource, SqliteKnowledgeBase};
pub use metrics::{LlmCounterSnapshot, LlmCounters};
pub use orchestrator::{Orchestrator, ProviderStatus};
pub use registry::ProviderRegistry;
pub use types::{Completion, CompletionRequest, GenerateRequest, LlmReply, Source, TaskType, UserTier};
pub use usage::{UsageLedger, UsageRecord, UsageStats, UsageWindow};
