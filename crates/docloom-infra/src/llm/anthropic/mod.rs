//! Anthropic Claude provider for the Messages API (`/v1/messages`).

pub mod client;
pub mod types;

pub use client::AnthropicProvider;
