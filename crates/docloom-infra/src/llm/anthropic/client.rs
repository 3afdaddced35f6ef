//! AnthropicProvider: concrete [`LlmProvider`] for Anthropic Claude.
//!
//! Sends non-streaming requests to the Messages API and maps every failure
//! onto a typed [`LlmError`] carrying the HTTP status, the `retry-after`
//! hint and the `request-id` header, so the retry wrapper can classify it.
//!
//! The API key is wrapped in [`secrecy::SecretString`] and is never logged
//! or included in `Debug` output.

use std::time::{Duration, Instant};

use docloom_core::llm::provider::LlmProvider;
use docloom_observe::genai_attrs::{
    GEN_AI_RESPONSE_FINISH_REASONS, GEN_AI_RESPONSE_ID, GEN_AI_USAGE_INPUT_TOKENS, GEN_AI_USAGE_OUTPUT_TOKENS,
    PROVIDER_ANTHROPIC, SPAN_PROVIDER_CALL,
};
use docloom_types::llm::{CompletionRequest, CompletionResponse, LlmError, StopReason};
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use tracing::Instrument;

use super::types::{
    AnthropicContentBlock, AnthropicErrorBody, AnthropicMessage, AnthropicRequest, AnthropicResponse,
};

/// Anthropic Claude LLM provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

// No Debug derive: keeps the client and key out of logs entirely.

impl AnthropicProvider {
    /// The Anthropic API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    /// Create a provider whose calls time out after `timeout`.
    pub fn new(api_key: SecretString, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Override the base URL (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn to_anthropic_request(request: &CompletionRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            system: request.system.clone(),
            temperature: request.temperature,
        }
    }

    fn transport_error(err: &reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Connection(format!("HTTP request failed: {err}"))
        }
    }

    /// Map a non-2xx response onto an [`LlmError`].
    fn status_error(status: u16, headers: &HeaderMap, body: &str) -> LlmError {
        let message = serde_json::from_str::<AnthropicErrorBody>(body)
            .map(|b| format!("{}: {}", b.error.error_type, b.error.message))
            .unwrap_or_else(|_| body.trim().to_string());
        LlmError::from_status(status, message, retry_after_ms(headers), request_id(headers))
    }

    fn into_completion(
        response: AnthropicResponse,
        request_id: Option<String>,
        latency_ms: u64,
    ) -> CompletionResponse {
        let content = response
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                AnthropicContentBlock::Other => None,
            })
            .collect::<String>();

        let stop_reason = response
            .stop_reason
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(StopReason::EndTurn);

        CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            latency_ms,
            stop_reason,
            cached: response.usage.cache_read_input_tokens.unwrap_or(0) > 0,
            request_id: request_id.or(Some(response.id)),
        }
    }
}

/// `retry-after` in seconds (integer or fractional), as milliseconds.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get("retry-after")?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0).round() as u64)
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_ANTHROPIC
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::to_anthropic_request(request);
        let span = tracing::debug_span!(
            SPAN_PROVIDER_CALL,
            gen_ai.system = PROVIDER_ANTHROPIC,
            gen_ai.request.model = %request.model,
            gen_ai.response.id = tracing::field::Empty,
            gen_ai.response.finish_reasons = tracing::field::Empty,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let response = self
                .client
                .post(self.url("/v1/messages"))
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", Self::API_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| Self::transport_error(&e))?;

            let status = response.status();
            let headers = response.headers().clone();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                return Err(Self::status_error(status.as_u16(), &headers, &error_body));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;
            let latency_ms = started.elapsed().as_millis() as u64;
            let completion = Self::into_completion(parsed, request_id(&headers), latency_ms);

            let span = tracing::Span::current();
            span.record(GEN_AI_RESPONSE_ID, completion.request_id.as_deref().unwrap_or_default());
            span.record(GEN_AI_RESPONSE_FINISH_REASONS, tracing::field::display(&completion.stop_reason));
            span.record(GEN_AI_USAGE_INPUT_TOKENS, completion.input_tokens);
            span.record(GEN_AI_USAGE_OUTPUT_TOKENS, completion.output_tokens);
            Ok(completion)
        }
        .instrument(span)
        .await
    }
}
