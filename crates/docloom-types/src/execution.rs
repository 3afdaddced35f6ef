//! Workflow execution types.
//!
//! A `WorkflowDefinition` is an ordered list of LLM-backed steps that each
//! produce one document type. An `ExecutionState` is the persisted snapshot of
//! one run of a workflow against a scope, holding a `StepProgress` per step.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::thread::SpaceRef;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// An ordered, linear workflow. The last step is the terminal step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_terminal_step(&self, step_id: &str) -> bool {
        self.steps.last().is_some_and(|s| s.id == step_id)
    }
}

/// A single LLM-backed step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    /// Persona the model is asked to adopt (e.g. "product manager").
    pub role: String,
    /// What the model should produce.
    pub task: String,
    /// Document type written on success.
    pub output_type: String,
    /// Document types in the same scope fed to the prompt as inputs.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Optional JSON schema the parsed output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Top-level fields that must be present in the parsed output.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "default_allow_clarification")]
    pub allow_clarification: bool,
}

fn default_allow_clarification() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Step progress
// ---------------------------------------------------------------------------

/// State of one step inside one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    WaitingInput,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::WaitingInput => write!(f, "waiting_input"),
        }
    }
}

/// Per-step state, persisted inside the execution snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub step_id: String,
    pub status: StepStatus,
    /// Starts at 1; increments only on clarification resume.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Id of the document written by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_document_id: Option<Uuid>,
    /// Questions raised by the model while waiting for input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    /// Free-form observability data (`telemetry`, `operational_error`, `outcome`).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StepProgress {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempt: 1,
            started_at: None,
            completed_at: None,
            error_message: None,
            output_document_id: None,
            questions: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::WaitingInput => write!(f, "waiting_input"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Persisted snapshot of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: Uuid,
    /// Thread that owns this execution's work items and ledger.
    pub thread_id: Uuid,
    pub workflow: WorkflowDefinition,
    pub scope: SpaceRef,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps: BTreeMap<String, StepProgress>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Create a new execution with every workflow step `pending`.
    pub fn new(
        thread_id: Uuid,
        workflow: WorkflowDefinition,
        scope: SpaceRef,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let steps = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepProgress::pending(&s.id)))
            .collect();
        Self {
            id: Uuid::now_v7(),
            thread_id,
            workflow,
            scope,
            status: ExecutionStatus::Pending,
            current_step: None,
            steps,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Progress for a step, inserting a pending entry if the step is unknown to the snapshot.
    pub fn step_mut(&mut self, step_id: &str) -> &mut StepProgress {
        self.steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepProgress::pending(step_id))
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// How a step invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// Paused for clarification; answer via `continue_with_clarification`.
    WaitingInput,
    /// The model output could not be parsed or failed validation.
    ValidationFailed,
    /// The provider stayed unavailable after retries.
    OperationalError,
}

impl StepOutcome {
    /// Message suitable for showing to an end user.
    pub fn user_message(self) -> &'static str {
        match self {
            StepOutcome::Completed => "step completed",
            StepOutcome::WaitingInput => "please answer these questions to continue",
            StepOutcome::ValidationFailed => "the generated output was invalid",
            StepOutcome::OperationalError => "temporarily unavailable, retry later",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Completed => write!(f, "completed"),
            StepOutcome::WaitingInput => write!(f, "waiting_input"),
            StepOutcome::ValidationFailed => write!(f, "validation_failed"),
            StepOutcome::OperationalError => write!(f, "operational_error"),
        }
    }
}

/// Telemetry recorded for every step invocation, whatever the outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTelemetry {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A user's answer to one clarification question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub question: String,
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "prd".to_string(),
            name: "PRD".to_string(),
            steps: vec![
                StepDefinition {
                    id: "brief".to_string(),
                    role: "analyst".to_string(),
                    task: "Write a brief".to_string(),
                    output_type: "brief".to_string(),
                    inputs: vec![],
                    schema: None,
                    required_fields: vec![],
                    allow_clarification: true,
                },
                StepDefinition {
                    id: "prd".to_string(),
                    role: "pm".to_string(),
                    task: "Write a PRD".to_string(),
                    output_type: "prd".to_string(),
                    inputs: vec!["brief".to_string()],
                    schema: None,
                    required_fields: vec!["title".to_string()],
                    allow_clarification: false,
                },
            ],
        }
    }

    #[test]
    fn test_new_execution_has_pending_steps() {
        let state = ExecutionState::new(Uuid::nil(), workflow(), SpaceRef::new("project", "P1"), "bob");
        assert_eq!(state.status, ExecutionStatus::Pending);
        assert_eq!(state.steps.len(), 2);
        assert!(state.steps.values().all(|s| s.status == StepStatus::Pending && s.attempt == 1));
    }

    #[test]
    fn test_terminal_step_is_last() {
        let wf = workflow();
        assert!(wf.is_terminal_step("prd"));
        assert!(!wf.is_terminal_step("brief"));
        assert!(wf.step("missing").is_none());
    }

    #[test]
    fn test_step_definition_defaults_allow_clarification() {
        let json = r#"{"id":"a","role":"r","task":"t","output_type":"doc"}"#;
        let step: StepDefinition = serde_json::from_str(json).unwrap();
        assert!(step.allow_clarification);
        assert!(step.inputs.is_empty());
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::WaitingInput.is_terminal());
        assert_eq!(StepStatus::WaitingInput.to_string(), "waiting_input");
    }

    #[test]
    fn test_operational_outcome_message_is_distinct() {
        assert_ne!(
            StepOutcome::OperationalError.user_message(),
            StepOutcome::WaitingInput.user_message()
        );
    }
}
