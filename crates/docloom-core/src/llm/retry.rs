//! Retry wrapper for provider calls with exponential backoff.
//!
//! `invoke_with_retry` wraps a single logical provider call:
//! - non-retryable failures (4xx client errors) fail after exactly one attempt;
//! - retryable failures wait before the next attempt, honoring a provider
//!   retry-after exactly, otherwise `base_delay * 2^n` capped at `max_delay`;
//! - after `1 + max_retries` attempts the last failure becomes a structured
//!   [`OperationalError`].

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docloom_types::config::RetryConfig;
use docloom_types::llm::{CompletionResponse, LlmError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry and delay policy for one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Ceiling for computed backoff (retry-after is never capped).
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Computed delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to wait after `error` on retry number `retry`.
    pub fn delay_for(&self, error: &LlmError, retry: u32) -> Duration {
        error.retry_after().unwrap_or_else(|| self.backoff(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationalError
// ---------------------------------------------------------------------------

/// Structured terminal failure of a provider call.
///
/// Distinct from parse/validation failures and from the clarification pause.
/// Persisted to step metadata as-is via [`OperationalError::to_metadata`].
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("provider '{provider}' unavailable after {attempts} attempt(s): {message}")]
pub struct OperationalError {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
    pub error_type: String,
    pub retryable: bool,
    /// Total provider invocations, including the first.
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
}

impl OperationalError {
    fn from_llm(provider: &str, error: &LlmError, attempts: u32, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            status_code: error.status_code(),
            request_id: error.request_id().map(str::to_string),
            message: error.to_string(),
            error_type: error.error_type().to_string(),
            retryable: error.is_retryable(),
            attempts,
            first_seen_at,
        }
    }

    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// invoke_with_retry
// ---------------------------------------------------------------------------

/// Invoke `call` until it succeeds, fails non-retryably, or retries run out.
///
/// `call` receives the 1-based attempt number.
pub async fn invoke_with_retry<F, Fut>(
    provider: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<CompletionResponse, OperationalError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<CompletionResponse, LlmError>>,
{
    let total_attempts = policy.max_retries.saturating_add(1);
    let mut first_seen_at: Option<DateTime<Utc>> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match call(attempt).await {
            Ok(response) => {
                if attempt > 1 {
                    tracing::info!(provider, attempt, "provider call succeeded after retry");
                }
                return Ok(response);
            }
            Err(error) => error,
        };

        let first_seen = *first_seen_at.get_or_insert_with(Utc::now);

        if !error.is_retryable() {
            tracing::error!(
                provider,
                attempt,
                error_type = error.error_type(),
                status = ?error.status_code(),
                error = %error,
                "non-retryable provider error"
            );
            return Err(OperationalError::from_llm(provider, &error, attempt, first_seen));
        }

        if attempt >= total_attempts {
            tracing::error!(
                provider,
                attempts = attempt,
                error_type = error.error_type(),
                status = ?error.status_code(),
                error = %error,
                "provider retries exhausted"
            );
            return Err(OperationalError::from_llm(provider, &error, attempt, first_seen));
        }

        let delay = policy.delay_for(&error, attempt - 1);
        tracing::warn!(
            provider,
            attempt,
            max_attempts = total_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable provider error, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
