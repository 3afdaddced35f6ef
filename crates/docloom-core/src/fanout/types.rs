//! Fan-out request and report types.

use std::fmt;

use docloom_types::thread::{SpaceRef, TargetRef, ThreadChildSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document handed directly to a unit's prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitInput {
    pub doc_type: String,
    pub title: String,
    pub content: String,
}

/// One independent generation unit (e.g. stories for one epic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutUnit {
    /// Unique within the request; names the unit in results and errors.
    pub unit_id: String,
    /// Scope the unit's output document is written to.
    pub scope: SpaceRef,
    pub output_type: String,
    pub role: String,
    pub task: String,
    #[serde(default)]
    pub inputs: Vec<UnitInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

impl FanOutUnit {
    pub fn new(
        unit_id: impl Into<String>,
        scope: SpaceRef,
        output_type: impl Into<String>,
        role: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            scope,
            output_type: output_type.into(),
            role: role.into(),
            task: task.into(),
            inputs: Vec::new(),
            schema: None,
        }
    }

    pub fn with_input(
        mut self,
        doc_type: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.inputs.push(UnitInput {
            doc_type: doc_type.into(),
            title: title.into(),
            content: content.into(),
        });
        self
    }

    /// Advisory lock label for the unit's output.
    pub fn lock_scope(&self) -> String {
        format!("{}:{}", self.scope, self.output_type)
    }
}

/// A batch of units run under one idempotent parent thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutRequest {
    /// Operation name; part of the parent's idempotency key.
    pub operation: String,
    pub space: SpaceRef,
    pub target: TargetRef,
    pub created_by: String,
    pub units: Vec<FanOutUnit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutStatus {
    /// Every processed unit succeeded (or nothing needed processing).
    Completed,
    /// At least one unit failed; the parent still completes.
    CompletedWithErrors,
    /// The parent thread is already running elsewhere; nothing was scheduled.
    Running,
    /// The parent thread already completed; nothing was scheduled.
    Skipped,
    /// The parent thread had already failed; nothing was scheduled.
    Failed,
}

impl fmt::Display for FanOutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanOutStatus::Completed => write!(f, "completed"),
            FanOutStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            FanOutStatus::Running => write!(f, "running"),
            FanOutStatus::Skipped => write!(f, "skipped"),
            FanOutStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A failed unit and the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub unit_id: String,
    pub error: String,
}

/// A unit whose results were written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    pub child_thread_id: Uuid,
    /// The generated sub-results.
    pub items: Vec<serde_json::Value>,
    /// Document holding the items, set once the aggregate write succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
}

/// Aggregate result of a fan-out run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutReport {
    pub parent_thread_id: Uuid,
    pub status: FanOutStatus,
    /// Units scheduled in this run.
    pub processed: usize,
    /// Total sub-results across successful units.
    pub generated: usize,
    /// Units skipped because their output already exists.
    pub skipped_units: Vec<String>,
    pub results: Vec<UnitResult>,
    pub errors: Vec<UnitError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ThreadChildSummary>,
}

impl FanOutReport {
    pub(crate) fn without_scheduling(
        parent_thread_id: Uuid,
        status: FanOutStatus,
        summary: Option<ThreadChildSummary>,
    ) -> Self {
        Self {
            parent_thread_id,
            status,
            processed: 0,
            generated: 0,
            skipped_units: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
            summary,
        }
    }

    pub fn failed_unit_ids(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.unit_id.as_str()).collect()
    }
}

/// Items of the streaming variant, in completion order.
#[derive(Debug, Clone)]
pub enum FanOutEvent {
    UnitComplete { unit_id: String, items: usize },
    UnitError(UnitError),
    /// Last item, yielded after the aggregate write.
    Finished(FanOutReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_lock_scope() {
        let unit = FanOutUnit::new("E7", SpaceRef::new("project", "P1"), "story_backlog", "pm", "stories");
        assert_eq!(unit.lock_scope(), "project:P1:story_backlog");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&FanOutStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"completed_with_errors\"");
        assert_eq!(FanOutStatus::Skipped.to_string(), "skipped");
    }
}
