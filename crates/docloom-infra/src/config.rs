//! Engine configuration loader.
//!
//! Reads `docloom.toml` and deserializes it into [`EngineConfig`]. A missing
//! or malformed file falls back to defaults with a warning, then a small set
//! of environment variables is layered on top.

use std::path::Path;

use docloom_types::config::EngineConfig;
use docloom_types::llm::ProviderKind;

/// Overrides `provider.kind` (`anthropic` or `scripted`).
pub const ENV_PROVIDER: &str = "DOCLOOM_PROVIDER";
/// Overrides `provider.model`.
pub const ENV_MODEL: &str = "DOCLOOM_MODEL";
/// Overrides `retry.max_retries`.
pub const ENV_MAX_RETRIES: &str = "DOCLOOM_MAX_RETRIES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Strictly parse a TOML document. Missing sections and fields take defaults.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Read and parse the config file, reporting every failure.
pub async fn read_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse_engine_config(&content)
}

/// Load configuration from `path`, then apply environment overrides.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: warning, then defaults.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let mut config = match read_engine_config(path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Layer `DOCLOOM_*` overrides onto `config`. Invalid values are ignored with a warning.
pub fn apply_env_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup(ENV_PROVIDER) {
        match value.parse::<ProviderKind>() {
            Ok(kind) => config.provider.kind = kind,
            Err(err) => tracing::warn!(variable = ENV_PROVIDER, "{err}, keeping {}", config.provider.kind),
        }
    }
    if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.trim().is_empty()) {
        config.provider.model = model;
    }
    if let Some(value) = lookup(ENV_MAX_RETRIES) {
        match value.trim().parse::<u32>() {
            Ok(retries) => config.retry.max_retries = retries,
            Err(err) => tracing::warn!(
                variable = ENV_MAX_RETRIES,
                "invalid retry count '{value}': {err}, keeping {}",
                config.retry.max_retries
            ),
        }
    }
}
