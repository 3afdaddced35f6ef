//! Engine configuration types for docloom.
//!
//! `EngineConfig` represents the top-level `docloom.toml`. Every section and
//! field has a default, so an empty file (or no file) yields a working setup.

use serde::{Deserialize, Serialize};

use crate::llm::ProviderKind;

/// Top-level configuration for the execution engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub provider: ProviderConfig,
    pub fanout: FanOutConfig,
    pub events: EventsConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

/// Bounded retry and backoff for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first (total = 1 + max_retries).
    pub max_retries: u32,
    /// First backoff delay; doubles on each subsequent retry.
    pub base_delay_ms: u64,
    /// Ceiling for computed backoff. Provider retry-after is not capped.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Which LLM backend to use and how to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: 4_096,
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum number of units generating at once.
    pub max_concurrency: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Idle window after which a progress stream emits a keep-alive.
    pub keepalive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { keepalive_secs: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Each input document is truncated to this many characters in prompts.
    pub max_input_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 12_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    pub otel: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.provider.kind, ProviderKind::Anthropic);
        assert_eq!(config.fanout.max_concurrency, 8);
        assert_eq!(config.events.keepalive_secs, 15);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.executor.max_input_chars, 12_000);
    }

    #[test]
    fn test_engine_config_deserialize_partial_sections() {
        let toml_str = r#"
[retry]
max_retries = 5

[provider]
kind = "scripted"
model = "test-model"

[fanout]
max_concurrency = 2
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.provider.kind, ProviderKind::Scripted);
        assert_eq!(config.provider.model, "test-model");
        assert_eq!(config.provider.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.fanout.max_concurrency, 2);
    }
}
