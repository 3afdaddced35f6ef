//! Repository trait definitions (ports).
//!
//! These traits define the storage interface the engine is written against.
//! The `memory` module provides lock-protected in-process adapters; a durable
//! storage engine is plugged in by implementing the same traits elsewhere.

pub mod document;
pub mod execution;
pub mod memory;
pub mod thread;
