//! HTTP backend for OpenAI-compatible, Anthropic, Gemini and Ollama APIs.
//!
//! Request bodies are built and responses parsed by pure functions so the
//! wire handling is testable without a server. The transport itself makes
//! exactly one attempt: retries belong to the orchestrator's fallback chain.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::backend::LlmBackend;
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::LlmError;
use crate::types::{Completion, CompletionRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;

/// A provider reached over HTTP.
pub struct HttpBackend {
    name: String,
    kind: ProviderKind,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: Client,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("has_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpBackend {
    /// Build a backend from its config, reading the API key from the
    /// environment variable the config names.
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty());
        Self::with_key(config, api_key)
    }

    /// Build a backend with an explicit key.
    #[must_use]
    pub fn with_key(config: &ProviderConfig, api_key: Option<String>) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            http: Client::new(),
        }
    }

    fn key(&self) -> Result<&str, LlmError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| LlmError::Unavailable(format!("provider '{}' has no API key", self.name)))
    }

    fn build(&self, request: &CompletionRequest) -> Result<RequestBuilder, LlmError> {
        let body = request_body(self.kind, &self.model, request);
        let builder = match self.kind {
            ProviderKind::Openai => self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(self.key()?),
            ProviderKind::Anthropic => self
                .http
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", self.key()?)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ProviderKind::Gemini => self
                .http
                .post(format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model))
                .query(&[("key", self.key()?)]),
            ProviderKind::Ollama => self.http.post(format!("{}/api/generate", self.base_url)),
        };
        Ok(builder.json(&body).timeout(Duration::from_millis(request.timeout_ms)))
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let start = Instant::now();
        let response = self.build(request)?.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(request.timeout_ms)
            } else {
                LlmError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = status.as_u16(), "Provider returned an error status");
            return Err(status_error(status, body));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (text, tokens_used) = parse_response(self.kind, &json)?;
        debug!(provider = %self.name, tokens_used, latency_ms, "Provider call succeeded");

        Ok(Completion {
            text,
            tokens_used,
            latency_ms,
            model: self.model.clone(),
        })
    }

    async fn probe(&self) -> Result<(), LlmError> {
        if !self.has_credentials() {
            return Err(LlmError::Unavailable(format!("provider '{}' has no API key", self.name)));
        }
        // Any HTTP answer at all means the host is reachable.
        self.http
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|_| ())
            .map_err(LlmError::from)
    }

    fn has_credentials(&self) -> bool {
        self.kind == ProviderKind::Ollama || self.api_key.is_some()
    }
}

/// Request body for one provider kind.
#[must_use]
pub fn request_body(kind: ProviderKind, model: &str, request: &CompletionRequest) -> Value {
    match kind {
        ProviderKind::Openai => json!({
            "model": model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }),
        ProviderKind::Anthropic => json!({
            "model": model,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.user }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }),
        ProviderKind::Gemini => json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.user }] }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        }),
        ProviderKind::Ollama => json!({
            "model": model,
            "prompt": format!("{}\n\n{}", request.system, request.user),
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        }),
    }
}

fn as_u32(value: &Value) -> u32 {
    value.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0)
}

/// Extract `(text, tokens_used)` from a provider's JSON answer.
///
/// # Errors
/// [`LlmError::ParseError`] when the text field is missing.
pub fn parse_response(kind: ProviderKind, json: &Value) -> Result<(String, u32), LlmError> {
    let (text, tokens) = match kind {
        ProviderKind::Openai => (
            json["choices"][0]["message"]["content"].as_str(),
            as_u32(&json["usage"]["total_tokens"]),
        ),
        ProviderKind::Anthropic => {
            let text = json["content"]
                .as_array()
                .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
                .and_then(|b| b["text"].as_str());
            let tokens = as_u32(&json["usage"]["input_tokens"]) + as_u32(&json["usage"]["output_tokens"]);
            (text, tokens)
        }
        ProviderKind::Gemini => (
            json["candidates"][0]["content"]["parts"][0]["text"].as_str(),
            as_u32(&json["usageMetadata"]["totalTokenCount"]),
        ),
        ProviderKind::Ollama => (
            json["response"].as_str(),
            as_u32(&json["prompt_eval_count"]) + as_u32(&json["eval_count"]),
        ),
    };
    let text = text.ok_or_else(|| LlmError::ParseError(format!("no completion text in {kind:?} response")))?;
    Ok((text.to_string(), tokens))
}

/// Map a non-success status to an error.
#[must_use]
pub fn status_error(status: StatusCode, mut body: String) -> LlmError {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::QuotaExceeded(body)
    } else {
        LlmError::Http {
            status: status.as_u16(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "You are a physiotherapy assistant.".into(),
            user: "Suggest a knee warm-up.".into(),
            max_tokens: 256,
            temperature: 0.2,
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn openai_body_and_reply() {
        let body = request_body(ProviderKind::Openai, "gpt-4o-mini", &request());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["max_tokens"], 256);

        let reply = json!({
            "choices": [{ "message": { "content": "Cycle for 5 minutes." } }],
            "usage": { "prompt_tokens": 20, "completion_tokens": 6, "total_tokens": 26 }
        });
        let (text, tokens) = parse_response(ProviderKind::Openai, &reply).expect("parse");
        assert_eq!(text, "Cycle for 5 minutes.");
        assert_eq!(tokens, 26);
    }

    #[test]
    fn anthropic_reply_sums_input_and_output_tokens() {
        let body = request_body(ProviderKind::Anthropic, "claude", &request());
        assert_eq!(body["system"], "You are a physiotherapy assistant.");
        let reply = json!({
            "content": [{ "type": "text", "text": "Heel slides." }],
            "usage": { "input_tokens": 30, "output_tokens": 4 }
        });
        assert_eq!(
            parse_response(ProviderKind::Anthropic, &reply).expect("parse"),
            ("Heel slides.".to_string(), 34)
        );
    }

    #[test]
    fn gemini_and_ollama_replies() {
        let gemini = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Quad sets." }] } }],
            "usageMetadata": { "totalTokenCount": 12 }
        });
        assert_eq!(parse_response(ProviderKind::Gemini, &gemini).expect("parse").1, 12);

        let ollama = json!({ "response": "Mini squats.", "prompt_eval_count": 9, "eval_count": 3 });
        assert_eq!(
            parse_response(ProviderKind::Ollama, &ollama).expect("parse"),
            ("Mini squats.".to_string(), 12)
        );
    }

    #[test]
    fn missing_text_is_a_parse_error() {
        let err = parse_response(ProviderKind::Openai, &json!({ "choices": [] })).expect_err("no text");
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[test]
    fn too_many_requests_maps_to_quota() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            LlmError::QuotaExceeded(_)
        ));
        let err = status_error(StatusCode::BAD_GATEWAY, "x".repeat(2_000));
        match err {
            LlmError::Http { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyless_cloud_provider_has_no_credentials() {
        let cloud = HttpBackend::with_key(&ProviderConfig::new("gpt", ProviderKind::Openai), None);
        assert!(!cloud.has_credentials());
        let local = HttpBackend::with_key(&ProviderConfig::new("local", ProviderKind::Ollama), None);
        assert!(local.has_credentials());
    }
}
