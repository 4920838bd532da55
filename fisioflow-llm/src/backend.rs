//! The seam between the orchestrator and a concrete provider.
//!
//! Production uses [`crate::client::HttpBackend`]; tests plug in fakes that
//! sleep, fail or answer canned text.

use async_trait::async_trait;

use crate::error::LlmError;
use crate::types::{Completion, CompletionRequest};

/// One LLM provider.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider name, unique within a registry.
    fn name(&self) -> &str;

    /// Run one completion. Deadlines are enforced by the caller; a backend
    /// may also apply `request.timeout_ms` to its own transport.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Cheap reachability check used by health probes.
    async fn probe(&self) -> Result<(), LlmError> {
        Ok(())
    }

    /// Whether the backend has what it needs to authenticate.
    fn has_credentials(&self) -> bool {
        true
    }
}
