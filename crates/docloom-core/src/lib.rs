//! Execution engine and repository trait definitions for docloom.
//!
//! This crate defines the "ports" (provider and repository traits) that the
//! infrastructure layer implements, plus the engine built on top of them:
//! retry wrapper, thread/ledger service, progress bus, step executor,
//! fan-out orchestrator and execution service. It depends only on
//! `docloom-types` -- never on `docloom-infra` or any network/IO crate.

pub mod event;
pub mod execution;
pub mod fanout;
pub mod llm;
pub mod repository;
pub mod step;
pub mod thread;

#[cfg(test)]
pub(crate) mod test_support;
