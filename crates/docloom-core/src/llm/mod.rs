//! LLM provider abstractions for docloom.
//!
//! - `LlmProvider`: native async trait for concrete provider implementations
//! - `BoxLlmProvider`: object-safe wrapper for runtime provider selection
//! - `retry`: bounded retry with exponential backoff and structured exhaustion errors

pub mod box_provider;
pub mod provider;
pub mod retry;
