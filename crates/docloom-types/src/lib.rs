//! Shared domain types for docloom.
//!
//! This crate contains the domain types used across the docloom engine:
//! threads, work items and the audit ledger, execution and step progress,
//! versioned documents, progress events, LLM request/response shapes,
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod execution;
pub mod llm;
pub mod thread;
