//! LLM provider implementations.
//!
//! Concrete implementations of the [`LlmProvider`](docloom_core::llm::provider::LlmProvider)
//! trait, plus [`create_provider`], which picks one from configuration.

pub mod anthropic;
pub mod scripted;

use std::time::Duration;

use docloom_core::llm::box_provider::BoxLlmProvider;
use docloom_types::config::ProviderConfig;
use docloom_types::llm::{LlmError, ProviderKind};
use secrecy::SecretString;

use self::anthropic::AnthropicProvider;
use self::scripted::ScriptedProvider;

/// Build the configured provider.
///
/// The Anthropic key is read from the environment variable named by
/// `config.api_key_env`; a missing or empty key is an authentication failure.
pub fn create_provider(config: &ProviderConfig) -> Result<BoxLlmProvider, LlmError> {
    create_provider_with(config, |name| std::env::var(name).ok())
}

/// [`create_provider`] with an explicit environment lookup.
pub fn create_provider_with(
    config: &ProviderConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<BoxLlmProvider, LlmError> {
    match config.kind {
        ProviderKind::Anthropic => {
            let key = lookup(&config.api_key_env)
                .filter(|k| !k.trim().is_empty())
                .ok_or(LlmError::AuthenticationFailed)?;
            let mut provider =
                AnthropicProvider::new(SecretString::from(key), Duration::from_secs(config.timeout_secs))?;
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.as_str());
            }
            tracing::info!(provider = %config.kind, model = %config.model, "provider configured");
            Ok(BoxLlmProvider::new(provider))
        }
        ProviderKind::Scripted => {
            tracing::info!(provider = %config.kind, "scripted provider configured, no network calls will be made");
            Ok(BoxLlmProvider::new(ScriptedProvider::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_without_key_fails_authentication() {
        let config = ProviderConfig::default();
        let result = create_provider_with(&config, |_| None);
        assert!(matches!(result, Err(LlmError::AuthenticationFailed)));

        let blank = create_provider_with(&config, |_| Some("  ".to_string()));
        assert!(matches!(blank, Err(LlmError::AuthenticationFailed)));
    }

    #[test]
    fn anthropic_reads_key_from_configured_variable() {
        let config = ProviderConfig {
            api_key_env: "MY_KEY".to_string(),
            ..ProviderConfig::default()
        };
        let provider = create_provider_with(&config, |name| (name == "MY_KEY").then(|| "sk-test".to_string()));
        assert_eq!(provider.unwrap().name(), "anthropic");
    }

    #[test]
    fn scripted_needs_no_key() {
        let config = ProviderConfig {
            kind: ProviderKind::Scripted,
            ..ProviderConfig::default()
        };
        assert_eq!(create_provider_with(&config, |_| None).unwrap().name(), "scripted");
    }
}
