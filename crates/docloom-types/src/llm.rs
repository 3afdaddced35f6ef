//! LLM request/response types for docloom.
//!
//! These types model the data shapes for provider interactions: completion
//! requests, completion responses with usage, and typed provider failures
//! that carry enough detail (retryability, status code, retry-after, request
//! id) for the retry wrapper to classify them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Role of a message in an LLM conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message in an LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Request to an LLM provider for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Response from an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub stop_reason: StopReason,
    /// Whether the provider served the prompt from its cache.
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Reason why the LLM stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    Other,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::Other => write!(f, "other"),
        }
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "end_turn" => Ok(StopReason::EndTurn),
            "max_tokens" => Ok(StopReason::MaxTokens),
            "stop_sequence" => Ok(StopReason::StopSequence),
            _ => Ok(StopReason::Other),
        }
    }
}

/// Errors from LLM provider operations.
///
/// Each variant knows whether it is transient ([`LlmError::is_retryable`]),
/// which HTTP status it corresponds to, and whether the provider asked for a
/// specific delay before the next attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited {
        retry_after_ms: Option<u64>,
        request_id: Option<String>,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("provider overloaded: {message}")]
    Overloaded {
        message: String,
        retry_after_ms: Option<u64>,
        request_id: Option<String>,
    },

    #[error("server error (HTTP {status}): {message}")]
    Server {
        status: u16,
        message: String,
        request_id: Option<String>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        request_id: Option<String>,
    },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl LlmError {
    /// Whether a retry may succeed without changing the request.
    ///
    /// Rate limits, timeouts, overload, 5xx and connection failures are
    /// transient; 4xx client errors and undecodable responses are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout(_)
                | LlmError::Overloaded { .. }
                | LlmError::Server { .. }
                | LlmError::Connection(_)
        )
    }

    /// HTTP status code associated with the failure, when one exists.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::RateLimited { .. } => Some(429),
            LlmError::Timeout(_) => Some(408),
            LlmError::Overloaded { .. } => Some(529),
            LlmError::Server { status, .. } => Some(*status),
            LlmError::InvalidRequest { .. } => Some(400),
            LlmError::AuthenticationFailed => Some(401),
            LlmError::PermissionDenied(_) => Some(403),
            LlmError::NotFound(_) => Some(404),
            LlmError::Connection(_) | LlmError::Deserialization(_) => None,
        }
    }

    /// Provider-specified delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms, .. }
            | LlmError::Overloaded { retry_after_ms, .. } => {
                retry_after_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }

    /// Provider request identifier, when the provider returned one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            LlmError::RateLimited { request_id, .. }
            | LlmError::Overloaded { request_id, .. }
            | LlmError::Server { request_id, .. }
            | LlmError::InvalidRequest { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Stable snake_case name of the failure kind, used in telemetry.
    pub fn error_type(&self) -> &'static str {
        match self {
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::Timeout(_) => "timeout",
            LlmError::Overloaded { .. } => "overloaded",
            LlmError::Server { .. } => "server_error",
            LlmError::Connection(_) => "connection_error",
            LlmError::InvalidRequest { .. } => "invalid_request",
            LlmError::AuthenticationFailed => "authentication_failed",
            LlmError::PermissionDenied(_) => "permission_denied",
            LlmError::NotFound(_) => "not_found",
            LlmError::Deserialization(_) => "deserialization_error",
        }
    }

    /// Map an HTTP status and body to the matching error variant.
    pub fn from_status(
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
        request_id: Option<String>,
    ) -> Self {
        match status {
            400 | 413 | 422 => LlmError::InvalidRequest {
                message,
                request_id,
            },
            401 => LlmError::AuthenticationFailed,
            403 => LlmError::PermissionDenied(message),
            404 => LlmError::NotFound(message),
            408 => LlmError::Timeout(message),
            429 => LlmError::RateLimited {
                retry_after_ms,
                request_id,
            },
            529 => LlmError::Overloaded {
                message,
                retry_after_ms,
                request_id,
            },
            s if s >= 500 => LlmError::Server {
                status: s,
                message,
                request_id,
            },
            s => LlmError::InvalidRequest {
                message: format!("HTTP {s}: {message}"),
                request_id,
            },
        }
    }
}

/// Which provider backend to construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    /// Deterministic in-process double that replays a fixed script.
    Scripted,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Scripted => write!(f, "scripted"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "scripted" => Ok(ProviderKind::Scripted),
            other => Err(format!("invalid provider kind: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: None, request_id: None }.is_retryable());
        assert!(LlmError::Timeout("slow".into()).is_retryable());
        assert!(LlmError::from_status(503, "down".into(), None, None).is_retryable());
        assert!(LlmError::from_status(529, "busy".into(), None, None).is_retryable());

        assert!(!LlmError::from_status(400, "bad".into(), None, None).is_retryable());
        assert!(!LlmError::from_status(401, "who".into(), None, None).is_retryable());
        assert!(!LlmError::from_status(403, "no".into(), None, None).is_retryable());
        assert!(!LlmError::Deserialization("garbage".into()).is_retryable());
    }

    #[test]
    fn test_from_status_preserves_status_code() {
        for status in [400u16, 401, 403, 404, 408, 429, 500, 502, 503, 529] {
            let err = LlmError::from_status(status, "x".into(), None, None);
            assert_eq!(err.status_code(), Some(status), "status {status}");
        }
    }

    #[test]
    fn test_retry_after_and_request_id() {
        let err = LlmError::from_status(429, "slow down".into(), Some(2500), Some("req_1".into()));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2500)));
        assert_eq!(err.request_id(), Some("req_1"));
        assert_eq!(err.error_type(), "rate_limited");
    }

    #[test]
    fn test_stop_reason_parse_unknown_is_other() {
        assert_eq!("end_turn".parse::<StopReason>().unwrap(), StopReason::EndTurn);
        assert_eq!("tool_use".parse::<StopReason>().unwrap(), StopReason::Other);
    }

    #[test]
    fn test_provider_kind_serde() {
        let json = serde_json::to_string(&ProviderKind::Scripted).unwrap();
        assert_eq!(json, "\"scripted\"");
        assert_eq!("Anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("openai".parse::<ProviderKind>().is_err());
    }
}
