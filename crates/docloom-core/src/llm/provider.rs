//! LlmProvider trait definition.
//!
//! This is the core abstraction that all language-model backends implement,
//! whether a real network provider or a deterministic test double.

use docloom_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Failures are
/// returned as typed [`LlmError`]s so the retry wrapper can classify them.
///
/// Implementations live in docloom-infra (e.g., `AnthropicProvider`,
/// `ScriptedProvider`).
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
