//! Progress event types for the docloom progress bus.
//!
//! `ProgressEvent` is ephemeral: it is never persisted and exists only to
//! drive live observers of one execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle notifications emitted during an execution or fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// Synthetic event delivered to a new subscriber.
    Connected,
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    ClarificationNeeded,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    /// One fan-out unit finished successfully.
    UnitComplete,
    /// One fan-out unit failed.
    UnitError,
}

impl ProgressEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressEventType::Connected => "connected",
            ProgressEventType::ExecutionStarted => "execution_started",
            ProgressEventType::StepStarted => "step_started",
            ProgressEventType::StepCompleted => "step_completed",
            ProgressEventType::StepFailed => "step_failed",
            ProgressEventType::ClarificationNeeded => "clarification_needed",
            ProgressEventType::ExecutionCompleted => "execution_completed",
            ProgressEventType::ExecutionFailed => "execution_failed",
            ProgressEventType::ExecutionCancelled => "execution_cancelled",
            ProgressEventType::UnitComplete => "unit_complete",
            ProgressEventType::UnitError => "unit_error",
        }
    }

    /// Observers close their stream after a terminal event.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressEventType::ExecutionCompleted
                | ProgressEventType::ExecutionFailed
                | ProgressEventType::ExecutionCancelled
        )
    }
}

impl fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    pub execution_id: Uuid,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(event_type: ProgressEventType, execution_id: Uuid) -> Self {
        Self {
            event_type,
            execution_id,
            step_id: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Render as a server-sent-events frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type, data)
    }
}
