//! LLM error types.
//!
//! [`LlmError`] describes one failed provider call or a local fault;
//! [`OrchestratorError`] is what `generate` surfaces once the fallback chain
//! has run out.

use fisioflow_store::StoreError;
use thiserror::Error;

/// Errors from a single backend call or a local component.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure.
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    /// The provider answered with something we could not read.
    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    /// The provider returned a non-success status.
    #[error("LLM provider returned HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// HTTP 429 or an equivalent quota signal.
    #[error("LLM provider quota exhausted: {0}")]
    QuotaExceeded(String),

    /// The call did not finish before its deadline.
    #[error("LLM request timed out after {0}ms")]
    Timeout(u64),

    /// Missing credentials, failed probe, or disabled.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    /// Configuration error.
    #[error("LLM configuration error: {0}")]
    Config(String),

    /// Knowledge item failed validation.
    #[error("Invalid knowledge item: {0}")]
    InvalidKnowledge(String),

    /// Knowledge base or usage ledger storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for LlmError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

impl LlmError {
    /// Stable identifier, independent of the message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestFailed(_) => "REQUEST_FAILED",
            Self::ParseError(_) => "PARSE_ERROR",
            Self::Http { .. } => "HTTP_STATUS",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::Config(_) => "CONFIG",
            Self::InvalidKnowledge(_) => "INVALID_KNOWLEDGE",
            Self::Store(_) => "STORAGE",
        }
    }

    /// Whether the fallback chain should move on to the next provider.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Timeout(_) | Self::Unavailable(_) | Self::QuotaExceeded(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408,
            Self::ParseError(_) | Self::Config(_) | Self::InvalidKnowledge(_) | Self::Store(_) => false,
        }
    }
}

/// What `generate` surfaces.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Every candidate failed (or none was available) and the knowledge base
    /// had nothing to offer.
    #[error("No LLM providers available{}", error_suffix(.last_error))]
    NoProvidersAvailable {
        /// Message of the last provider failure, if any provider was tried.
        last_error: Option<String>,
    },

    /// Local fault outside the provider chain.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
}

impl OrchestratorError {
    /// Stable identifier, independent of the message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoProvidersAvailable { .. } => "NO_PROVIDERS_AVAILABLE",
            Self::Llm(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(LlmError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!LlmError::Http { status: 400, body: String::new() }.is_transient());
        assert!(LlmError::Timeout(100).is_transient());
        assert!(!LlmError::ParseError("x".into()).is_transient());
    }

    #[test]
    fn exhaustion_message_carries_last_error() {
        let err = OrchestratorError::NoProvidersAvailable {
            last_error: Some("timed out".into()),
        };
        assert_eq!(err.kind(), "NO_PROVIDERS_AVAILABLE");
        assert_eq!(err.to_string(), "No LLM providers available: timed out");
        let none = OrchestratorError::NoProvidersAvailable { last_error: None };
        assert_eq!(none.to_string(), "No LLM providers available");
    }
}
