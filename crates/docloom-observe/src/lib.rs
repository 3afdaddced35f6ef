//! Observability setup for docloom: tracing subscriber initialization and
//! GenAI semantic-convention field names for provider spans.

pub mod genai_attrs;
pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
