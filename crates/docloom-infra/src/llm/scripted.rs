//! Deterministic in-process provider.
//!
//! Replays a fixed queue of replies in order, then answers every further
//! call with a fallback body. Used for dry runs and for wiring tests that
//! must not touch the network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use docloom_core::llm::provider::LlmProvider;
use docloom_observe::genai_attrs::PROVIDER_SCRIPTED;
use docloom_types::llm::{CompletionRequest, CompletionResponse, LlmError, StopReason};

/// Reply body used once the script is exhausted.
pub const DEFAULT_FALLBACK: &str = "{}";

pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    calls: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: DEFAULT_FALLBACK.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replies still queued.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn next_reply(&self) -> Result<String, LlmError> {
        let next = match self.script.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER_SCRIPTED
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self.next_reply()?;
        let input_chars: usize = request.system.as_deref().map_or(0, str::len)
            + request.messages.iter().map(|m| m.content.len()).sum::<usize>();
        tracing::debug!(model = %request.model, input_chars, "scripted completion");

        Ok(CompletionResponse {
            // ~4 characters per token, matching rough English averages.
            input_tokens: (input_chars / 4) as u32,
            output_tokens: (content.len() / 4) as u32,
            content,
            latency_ms: 0,
            stop_reason: StopReason::EndTurn,
            cached: false,
            request_id: None,
        })
    }
}
