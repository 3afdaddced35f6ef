//! Durable thread / work item / ledger model.
//!
//! - `ThreadService`: idempotent thread lifecycle, work item transitions and
//!   ledger appends over a [`ThreadRepository`](crate::repository::thread::ThreadRepository)

pub mod service;

pub use service::{ThreadError, ThreadService};
