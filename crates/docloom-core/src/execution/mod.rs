//! Workflow executions: lifecycle, cancellation and progress streaming.

pub mod cancel;
pub mod service;

pub use cancel::{CancellationRegistry, InFlightStep};
pub use service::{ExecutionError, ExecutionService, StartExecution};
