//! Shared test doubles for the engine's unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use docloom_types::llm::{CompletionRequest, CompletionResponse, LlmError, StopReason};

use crate::llm::provider::LlmProvider;

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<CompletionResponse, LlmError>>>),
    Routed(Responder),
}

/// Provider double that replays a queue of results or routes by request.
pub struct ScriptedLlm {
    script: Script,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    /// Replays `results` in order; once exhausted, every call fails with a
    /// non-retryable error.
    pub fn new(results: Vec<Result<CompletionResponse, LlmError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(results.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Computes each result from the request.
    pub fn routed<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync + 'static,
    {
        Self {
            script: Script::Routed(Box::new(f)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers interleave like real I/O.
        tokio::task::yield_now().await;
        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Deserialization("script exhausted".to_string()))),
            Script::Routed(f) => f(request),
        }
    }
}

pub fn ok_response(content: &str) -> CompletionResponse {
    CompletionResponse {
        content: content.to_string(),
        input_tokens: 12,
        output_tokens: 34,
        latency_ms: 5,
        stop_reason: StopReason::EndTurn,
        cached: false,
        request_id: Some("req_test".to_string()),
    }
}

pub fn server_error() -> LlmError {
    LlmError::from_status(503, "service unavailable".to_string(), None, Some("req_503".to_string()))
}

/// Concatenated text of every message plus the system prompt.
pub fn request_text(request: &CompletionRequest) -> String {
    let mut text = request.system.clone().unwrap_or_default();
    for m in &request.messages {
        text.push('\n');
        text.push_str(&m.content);
    }
    text
}
