//! Parallel fan-out of independent generation units under one parent thread.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{FanOutError, FanOutOrchestrator};
pub use types::{
    FanOutEvent, FanOutReport, FanOutRequest, FanOutStatus, FanOutUnit, UnitError, UnitInput,
    UnitResult,
};
