//! Step executor: drives one workflow step against the provider.
//!
//! State machine per step:
//!
//! ```text
//! pending|failed --execute--> running --> completed | failed | waiting_input
//! waiting_input --continue_with_clarification (attempt+1)--> running --> ...
//! ```
//!
//! Each run gathers and condenses input documents, builds the prompt, calls
//! the provider through the retry wrapper, then interprets the raw text:
//! clarification first (when allowed), then parse and validation. Only a
//! valid result writes a document. Provider exhaustion is recorded as an
//! operational error with its own outcome, never as clarification or success.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use docloom_types::config::{ExecutorConfig, ProviderConfig};
use docloom_types::document::Document;
use docloom_types::error::RepositoryError;
use docloom_types::event::{ProgressEvent, ProgressEventType};
use docloom_types::execution::{
    ClarificationAnswer, ExecutionState, StepDefinition, StepOutcome, StepStatus, StepTelemetry,
};
use docloom_types::llm::CompletionRequest;
use docloom_types::thread::SpaceRef;
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use super::clarification::Clarification;
use super::parser::{JsonOutputParser, OutputParser, ParseSpec};
use super::prompt::{CondensedInput, PromptBuilder, PromptInput, TemplatePromptBuilder};
use crate::event::bus::ProgressBus;
use crate::execution::cancel::CancellationRegistry;
use crate::llm::box_provider::BoxLlmProvider;
use crate::llm::retry::{OperationalError, RetryPolicy, invoke_with_retry};
use crate::repository::document::DocumentRepository;
use crate::repository::thread::ThreadRepository;
use crate::thread::service::{ThreadError, ThreadService};

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step_id}' is {status}, expected {expected}")]
    InvalidState {
        step_id: String,
        status: StepStatus,
        expected: &'static str,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Where ledger entries for a generation are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerScope {
    pub thread_id: Uuid,
    pub work_item_id: Uuid,
}

/// Result of one `execute` / `continue_with_clarification` call.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub outcome: StepOutcome,
    pub document: Option<Document>,
    pub questions: Vec<String>,
    pub errors: Vec<String>,
    pub telemetry: StepTelemetry,
    pub operational_error: Option<OperationalError>,
}

impl StepResult {
    /// Message suitable for the end user.
    pub fn user_message(&self) -> &'static str {
        self.outcome.user_message()
    }
}

/// Model parameters applied to every generation.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Per-input character budget when condensing documents into prompts.
    pub max_input_chars: usize,
}

impl GenerationSettings {
    pub fn from_config(provider: &ProviderConfig, executor: &ExecutorConfig) -> Self {
        Self {
            model: provider.model.clone(),
            max_tokens: provider.max_tokens,
            temperature: Some(provider.temperature),
            max_input_chars: executor.max_input_chars,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default(), &ExecutorConfig::default())
    }
}

/// One self-contained generation request, shared by workflow steps and fan-out units.
#[derive(Debug, Clone)]
pub struct GenerationSpec<'a> {
    /// Label used in ledger payloads and logs.
    pub label: &'a str,
    pub role: &'a str,
    pub task: &'a str,
    pub output_type: &'a str,
    pub inputs: Vec<CondensedInput>,
    pub context: Option<&'a serde_json::Value>,
    pub answers: &'a [ClarificationAnswer],
    pub schema: Option<&'a serde_json::Value>,
    pub required_fields: &'a [String],
    pub check_clarification: bool,
}

/// How one generation ended.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Parsed(serde_json::Value),
    Clarification(Clarification),
    Invalid(Vec<String>),
    Unavailable(OperationalError),
}

impl GenerationOutcome {
    pub fn step_outcome(&self) -> StepOutcome {
        match self {
            GenerationOutcome::Parsed(_) => StepOutcome::Completed,
            GenerationOutcome::Clarification(_) => StepOutcome::WaitingInput,
            GenerationOutcome::Invalid(_) => StepOutcome::ValidationFailed,
            GenerationOutcome::Unavailable(_) => StepOutcome::OperationalError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub outcome: GenerationOutcome,
    pub telemetry: StepTelemetry,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs workflow steps and standalone generations.
pub struct StepExecutor<D: DocumentRepository, T: ThreadRepository> {
    provider: Arc<BoxLlmProvider>,
    documents: Arc<D>,
    threads: Arc<ThreadService<T>>,
    bus: ProgressBus,
    prompts: Arc<dyn PromptBuilder>,
    parser: Arc<dyn OutputParser>,
    policy: RetryPolicy,
    settings: GenerationSettings,
    cancellations: CancellationRegistry,
}

impl<D: DocumentRepository, T: ThreadRepository> StepExecutor<D, T> {
    pub fn new(
        provider: Arc<BoxLlmProvider>,
        documents: Arc<D>,
        threads: Arc<ThreadService<T>>,
        bus: ProgressBus,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            provider,
            documents,
            threads,
            bus,
            prompts: Arc::new(TemplatePromptBuilder::new()),
            parser: Arc::new(JsonOutputParser::new()),
            policy: RetryPolicy::default(),
            settings,
            cancellations: CancellationRegistry::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_cancellations(mut self, cancellations: CancellationRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    // -----------------------------------------------------------------------
    // Workflow steps
    // -----------------------------------------------------------------------

    /// Run a `pending` or `failed` step.
    pub async fn execute(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        context: Option<&serde_json::Value>,
        ledger: Option<&LedgerScope>,
    ) -> Result<StepResult, StepError> {
        let step = Self::step_definition(state, step_id)?;
        let status = state.step_mut(step_id).status;
        if !matches!(status, StepStatus::Pending | StepStatus::Failed) {
            return Err(StepError::InvalidState {
                step_id: step_id.to_string(),
                status,
                expected: "pending or failed",
            });
        }
        let check_clarification = step.allow_clarification;
        self.run_step(state, &step, context, &[], check_clarification, ledger).await
    }

    /// Resume a `waiting_input` step with the user's answers.
    ///
    /// Increments the attempt and disables clarification detection for this pass.
    pub async fn continue_with_clarification(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        answers: &[ClarificationAnswer],
        context: Option<&serde_json::Value>,
        ledger: Option<&LedgerScope>,
    ) -> Result<StepResult, StepError> {
        let step = Self::step_definition(state, step_id)?;
        let progress = state.step_mut(step_id);
        if progress.status != StepStatus::WaitingInput {
            return Err(StepError::InvalidState {
                step_id: step_id.to_string(),
                status: progress.status,
                expected: "waiting_input",
            });
        }
        progress.attempt += 1;
        let attempt = progress.attempt;
        tracing::info!(
            execution_id = %state.id,
            step_id,
            attempt,
            answers = answers.len(),
            "resuming step with clarification answers"
        );
        self.run_step(state, &step, context, answers, false, ledger).await
    }

    fn step_definition(state: &ExecutionState, step_id: &str) -> Result<StepDefinition, StepError> {
        state
            .workflow
            .step(step_id)
            .cloned()
            .ok_or_else(|| StepError::UnknownStep(step_id.to_string()))
    }

    async fn run_step(
        &self,
        state: &mut ExecutionState,
        step: &StepDefinition,
        context: Option<&serde_json::Value>,
        answers: &[ClarificationAnswer],
        check_clarification: bool,
        ledger: Option<&LedgerScope>,
    ) -> Result<StepResult, StepError> {
        let execution_id = state.id;
        let now = Utc::now();
        let attempt = {
            let progress = state.step_mut(&step.id);
            progress.status = StepStatus::Running;
            progress.started_at = Some(now);
            progress.completed_at = None;
            progress.error_message = None;
            progress.questions.clear();
            progress.attempt
        };
        state.current_step = Some(step.id.clone());
        state.updated_at = now;

        tracing::info!(execution_id = %execution_id, step_id = %step.id, attempt, "step started");
        self.bus.publish(
            ProgressEvent::new(ProgressEventType::StepStarted, execution_id)
                .with_step(&step.id)
                .with_data(json!({ "attempt": attempt, "role": step.role })),
        );

        let inputs = match self.gather_inputs(&state.scope, &step.inputs).await {
            Ok(inputs) => inputs,
            Err(e) => {
                self.mark_failed(state, &step.id, &format!("failed to load inputs: {e}"), None);
                return Err(e.into());
            }
        };

        let generation = self
            .generate(
                GenerationSpec {
                    label: &step.id,
                    role: &step.role,
                    task: &step.task,
                    output_type: &step.output_type,
                    inputs,
                    context,
                    answers,
                    schema: step.schema.as_ref(),
                    required_fields: &step.required_fields,
                    check_clarification,
                },
                ledger,
            )
            .await;

        let Generation { outcome, telemetry } = generation;
        let step_outcome = outcome.step_outcome();
        {
            let progress = state.step_mut(&step.id);
            progress
                .metadata
                .insert("telemetry".to_string(), serde_json::to_value(&telemetry).unwrap_or_default());
            progress
                .metadata
                .insert("outcome".to_string(), json!(step_outcome.to_string()));
        }

        let mut result = StepResult {
            step_id: step.id.clone(),
            outcome: step_outcome,
            document: None,
            questions: Vec::new(),
            errors: Vec::new(),
            telemetry,
            operational_error: None,
        };

        match outcome {
            GenerationOutcome::Clarification(clarification) => {
                let progress = state.step_mut(&step.id);
                progress.status = StepStatus::WaitingInput;
                progress.questions = clarification.questions.clone();
                state.updated_at = Utc::now();

                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    questions = clarification.questions.len(),
                    "step waiting for clarification"
                );
                self.bus.publish(
                    ProgressEvent::new(ProgressEventType::ClarificationNeeded, execution_id)
                        .with_step(&step.id)
                        .with_data(json!({ "questions": clarification.questions, "attempt": attempt })),
                );
                result.questions = clarification.questions;
            }
            GenerationOutcome::Invalid(errors) => {
                self.mark_failed(state, &step.id, &errors.join("; "), Some(step_outcome));
                result.errors = errors;
            }
            GenerationOutcome::Unavailable(op_err) => {
                state
                    .step_mut(&step.id)
                    .metadata
                    .insert("operational_error".to_string(), op_err.to_metadata());
                self.mark_failed(state, &step.id, &op_err.message, Some(step_outcome));
                result.errors = vec![op_err.message.clone()];
                result.operational_error = Some(op_err);
            }
            GenerationOutcome::Parsed(value) => {
                let title = value
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or(&step.output_type)
                    .to_string();
                let draft = Document::draft(state.scope.clone(), &step.output_type, title, value)
                    .with_source_step(&step.id);
                let saved = match self.documents.save(draft).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        self.mark_failed(state, &step.id, &format!("failed to save output: {e}"), None);
                        return Err(e.into());
                    }
                };
                if let Some(scope) = ledger {
                    self.ledger_result(
                        self.threads
                            .record_mutation(
                                &scope.thread_id,
                                &scope.work_item_id,
                                json!({
                                    "action": "document_saved",
                                    "document_id": saved.id,
                                    "doc_type": saved.doc_type,
                                    "version": saved.version,
                                }),
                            )
                            .await,
                        "mutation",
                    );
                }

                let completed_at = Utc::now();
                let progress = state.step_mut(&step.id);
                progress.status = StepStatus::Completed;
                progress.completed_at = Some(completed_at);
                progress.output_document_id = Some(saved.id);
                state.updated_at = completed_at;

                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    document_id = %saved.id,
                    version = saved.version,
                    "step completed"
                );
                self.bus.publish(
                    ProgressEvent::new(ProgressEventType::StepCompleted, execution_id)
                        .with_step(&step.id)
                        .with_data(json!({
                            "document_id": saved.id,
                            "output_type": saved.doc_type,
                            "version": saved.version,
                            "attempt": attempt,
                        })),
                );

                if state.workflow.is_terminal_step(&step.id) {
                    if self.cancellations.is_cancelled(&execution_id) {
                        tracing::info!(
                            execution_id = %execution_id,
                            step_id = %step.id,
                            "terminal step finished after cancellation, execution stays cancelled"
                        );
                    } else {
                        self.bus.publish(
                            ProgressEvent::new(ProgressEventType::ExecutionCompleted, execution_id)
                                .with_step(&step.id)
                                .with_data(json!({ "document_id": saved.id })),
                        );
                    }
                }
                result.document = Some(saved);
            }
        }

        Ok(result)
    }

    fn mark_failed(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        message: &str,
        outcome: Option<StepOutcome>,
    ) {
        let execution_id = state.id;
        let now = Utc::now();
        let progress = state.step_mut(step_id);
        progress.status = StepStatus::Failed;
        progress.completed_at = Some(now);
        progress.error_message = Some(message.to_string());
        state.updated_at = now;

        tracing::warn!(execution_id = %execution_id, step_id, error = message, "step failed");
        let mut data = json!({ "error": message });
        if let Some(outcome) = outcome {
            data["outcome"] = json!(outcome.to_string());
            data["user_message"] = json!(outcome.user_message());
        }
        self.bus.publish(
            ProgressEvent::new(ProgressEventType::StepFailed, execution_id)
                .with_step(step_id)
                .with_data(data),
        );
    }

    /// Latest version of each requested document type, condensed for prompting.
    pub async fn gather_inputs(
        &self,
        scope: &SpaceRef,
        doc_types: &[String],
    ) -> Result<Vec<CondensedInput>, RepositoryError> {
        let mut inputs = Vec::with_capacity(doc_types.len());
        for doc_type in doc_types {
            match self.documents.get_by_scope_type(scope, doc_type, None).await? {
                Some(doc) => inputs.push(CondensedInput::condense(
                    &doc.doc_type,
                    &doc.title,
                    &doc.content_text(),
                    self.settings.max_input_chars,
                )),
                None => tracing::debug!(scope = %scope, doc_type, "input document not found, skipping"),
            }
        }
        Ok(inputs)
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Build the prompt, call the provider with retries and interpret the reply.
    ///
    /// Never fails: every failure mode is a [`GenerationOutcome`]. Telemetry is
    /// filled in regardless of outcome.
    pub async fn generate(&self, spec: GenerationSpec<'_>, ledger: Option<&LedgerScope>) -> Generation {
        let prompt = self.prompts.build(&PromptInput {
            role: spec.role,
            task: spec.task,
            output_type: spec.output_type,
            inputs: &spec.inputs,
            context: spec.context,
            answers: spec.answers,
            schema: spec.schema,
            allow_questions: spec.check_clarification,
        });
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages: prompt.messages,
            system: Some(prompt.system),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        if let Some(scope) = ledger {
            self.ledger_result(
                self.threads
                    .record_prompt(
                        &scope.thread_id,
                        &scope.work_item_id,
                        json!({
                            "label": spec.label,
                            "model": request.model,
                            "system": request.system,
                            "messages": request.messages,
                            "inputs": spec.inputs.iter().map(|i| &i.doc_type).collect::<Vec<_>>(),
                        }),
                    )
                    .await,
                "prompt",
            );
        }

        let mut telemetry = StepTelemetry {
            provider: self.provider.name().to_string(),
            model: request.model.clone(),
            ..StepTelemetry::default()
        };

        let started = Instant::now();
        let mut attempts = 0u32;
        let provider = &self.provider;
        let span = tracing::info_span!(
            "gen_ai.generate",
            gen_ai.system = provider.name(),
            gen_ai.request.model = %request.model,
            gen_ai.request.max_tokens = request.max_tokens,
            gen_ai.request.temperature = ?request.temperature,
            label = spec.label,
        );
        let result = invoke_with_retry(provider.name(), &self.policy, |attempt| {
            attempts = attempt;
            provider.complete(&request)
        })
        .instrument(span)
        .await;

        let response = match result {
            Ok(response) => response,
            Err(op_err) => {
                telemetry.attempts = op_err.attempts;
                telemetry.latency_ms = started.elapsed().as_millis() as u64;
                telemetry.error_type = Some(op_err.error_type.clone());
                telemetry.error_message = Some(op_err.message.clone());
                telemetry.outcome = Some(StepOutcome::OperationalError);
                if let Some(scope) = ledger {
                    self.ledger_result(
                        self.threads
                            .record_error(&scope.thread_id, Some(&scope.work_item_id), op_err.to_metadata())
                            .await,
                        "error",
                    );
                }
                return Generation {
                    outcome: GenerationOutcome::Unavailable(op_err),
                    telemetry,
                };
            }
        };

        telemetry.attempts = attempts;
        telemetry.input_tokens = response.input_tokens;
        telemetry.output_tokens = response.output_tokens;
        telemetry.latency_ms = response.latency_ms;

        if let Some(scope) = ledger {
            self.ledger_result(
                self.threads
                    .record_response(
                        &scope.thread_id,
                        &scope.work_item_id,
                        json!({
                            "content": response.content,
                            "input_tokens": response.input_tokens,
                            "output_tokens": response.output_tokens,
                            "latency_ms": response.latency_ms,
                            "stop_reason": response.stop_reason,
                            "cached": response.cached,
                            "request_id": response.request_id,
                            "attempts": attempts,
                        }),
                    )
                    .await,
                "response",
            );
        }

        let parse = self.parser.parse(
            &response.content,
            &ParseSpec {
                schema: spec.schema,
                required_fields: spec.required_fields,
                check_clarification: spec.check_clarification,
            },
        );
        if let Some(scope) = ledger {
            self.ledger_result(
                self.threads
                    .record_parse_report(&scope.thread_id, &scope.work_item_id, parse.report())
                    .await,
                "parse report",
            );
        }

        let outcome = if let Some(clarification) = parse.clarification.clone() {
            GenerationOutcome::Clarification(clarification)
        } else if parse.is_valid() {
            match parse.parsed {
                Some(value) => GenerationOutcome::Parsed(value),
                None => GenerationOutcome::Invalid(vec!["output was empty".to_string()]),
            }
        } else {
            GenerationOutcome::Invalid(parse.errors())
        };

        telemetry.outcome = Some(outcome.step_outcome());
        if let GenerationOutcome::Invalid(errors) = &outcome {
            telemetry.error_type = Some("validation".to_string());
            telemetry.error_message = Some(errors.join("; "));
        }

        tracing::debug!(
            label = spec.label,
            provider = %telemetry.provider,
            attempts = telemetry.attempts,
            input_tokens = telemetry.input_tokens,
            output_tokens = telemetry.output_tokens,
            outcome = ?telemetry.outcome,
            "generation finished"
        );
        Generation { outcome, telemetry }
    }

    /// Ledger appends are fire-and-forget: a failed append is logged, not raised.
    fn ledger_result(&self, result: Result<(), ThreadError>, what: &str) {
        if let Err(e) = result {
            tracing::warn!(error = %e, entry = what, "failed to append ledger entry");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryDocumentRepository, InMemoryThreadRepository};
    use crate::test_support::{ScriptedLlm, ok_response, request_text, server_error};
    use docloom_types::execution::WorkflowDefinition;
    use docloom_types::thread::{LedgerEntryType, NewThread, TargetRef};
    use std::time::Duration;

    type Executor = StepExecutor<InMemoryDocumentRepository, InMemoryThreadRepository>;

    struct Harness {
        executor: Executor,
        documents: Arc<InMemoryDocumentRepository>,
        threads: Arc<ThreadService<InMemoryThreadRepository>>,
        bus: ProgressBus,
    }

    fn harness(llm: ScriptedLlm) -> Harness {
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let threads = Arc::new(ThreadService::new(InMemoryThreadRepository::new()));
        let bus = ProgressBus::new();
        let executor = StepExecutor::new(
            Arc::new(BoxLlmProvider::new(llm)),
            Arc::clone(&documents),
            Arc::clone(&threads),
            bus.clone(),
            GenerationSettings {
                max_input_chars: 20,
                ..GenerationSettings::default()
            },
        )
        .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(10)));
        Harness {
            executor,
            documents,
            threads,
            bus,
        }
    }

    fn step(id: &str, inputs: &[&str], allow_clarification: bool) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            role: "product manager".to_string(),
            task: format!("Write the {id}"),
            output_type: id.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            schema: None,
            required_fields: vec!["title".to_string()],
            allow_clarification,
        }
    }

    fn state(steps: Vec<StepDefinition>) -> ExecutionState {
        let workflow = WorkflowDefinition {
            id: "prd".to_string(),
            name: "PRD".to_string(),
            steps,
        };
        ExecutionState::new(Uuid::now_v7(), workflow, SpaceRef::new("project", "P1"), "alice")
    }

    fn drain(sub: &mut crate::event::bus::Subscription) -> Vec<ProgressEventType> {
        let mut events = Vec::new();
        while let Some(e) = sub.try_recv() {
            events.push(e.event_type);
        }
        events
    }

    #[tokio::test]
    async fn successful_step_persists_document_and_emits_events() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"title": "Todo PRD"}"#))]));
        let mut state = state(vec![step("prd", &[], true)]);
        let mut sub = h.bus.subscribe(state.id);

        let result = h.executor.execute(&mut state, "prd", None, None).await.unwrap();

        assert_eq!(result.outcome, StepOutcome::Completed);
        let doc = result.document.unwrap();
        assert_eq!(doc.title, "Todo PRD");
        assert_eq!(doc.source_step_id.as_deref(), Some("prd"));
        let progress = &state.steps["prd"];
        assert_eq!(progress.status, StepStatus::Completed);
        assert_eq!(progress.output_document_id, Some(doc.id));
        assert_eq!(progress.metadata["telemetry"]["input_tokens"], 12);
        assert_eq!(progress.metadata["outcome"], "completed");

        assert_eq!(
            drain(&mut sub),
            vec![
                ProgressEventType::Connected,
                ProgressEventType::StepStarted,
                ProgressEventType::StepCompleted,
                ProgressEventType::ExecutionCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn non_terminal_step_does_not_complete_execution() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"title": "Brief"}"#))]));
        let mut state = state(vec![step("brief", &[], true), step("prd", &["brief"], true)]);
        let mut sub = h.bus.subscribe(state.id);

        h.executor.execute(&mut state, "brief", None, None).await.unwrap();
        assert!(!drain(&mut sub).contains(&ProgressEventType::ExecutionCompleted));
    }

    #[tokio::test]
    async fn clarification_pauses_then_resume_completes() {
        let llm = ScriptedLlm::routed(|request| {
            if request_text(request).contains("Small teams") {
                Ok(ok_response(r#"{"title": "PRD for small teams"}"#))
            } else {
                Ok(ok_response("Who are the target users?"))
            }
        });
        let h = harness(llm);
        let mut state = state(vec![step("prd", &[], true)]);
        let mut sub = h.bus.subscribe(state.id);

        let paused = h.executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(paused.outcome, StepOutcome::WaitingInput);
        assert_eq!(paused.questions, vec!["Who are the target users?"]);
        assert_eq!(state.steps["prd"].status, StepStatus::WaitingInput);
        assert!(h.documents.list_by_scope(&state.scope).await.unwrap().is_empty());
        assert!(drain(&mut sub).contains(&ProgressEventType::ClarificationNeeded));

        let answers = vec![ClarificationAnswer {
            question: "Who are the target users?".to_string(),
            answer: "Small teams".to_string(),
        }];
        let resumed = h
            .executor
            .continue_with_clarification(&mut state, "prd", &answers, None, None)
            .await
            .unwrap();
        assert_eq!(resumed.outcome, StepOutcome::Completed);
        assert_eq!(state.steps["prd"].attempt, 2);
        assert_eq!(state.steps["prd"].status, StepStatus::Completed);
        assert!(state.steps["prd"].questions.is_empty());
        assert_eq!(h.documents.list_by_scope(&state.scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resume_disables_clarification_detection() {
        let h = harness(ScriptedLlm::new(vec![
            Ok(ok_response("Could you clarify the scope?")),
            Ok(ok_response("Still unclear, what platform?")),
        ]));
        let mut state = state(vec![step("prd", &[], true)]);
        h.executor.execute(&mut state, "prd", None, None).await.unwrap();

        let result = h
            .executor
            .continue_with_clarification(&mut state, "prd", &[], None, None)
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::ValidationFailed);
        assert_eq!(state.steps["prd"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn continue_requires_waiting_input() {
        let h = harness(ScriptedLlm::new(vec![]));
        let mut state = state(vec![step("prd", &[], true)]);

        let err = h
            .executor
            .continue_with_clarification(&mut state, "prd", &[], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidState { status: StepStatus::Pending, .. }));
    }

    #[tokio::test]
    async fn completed_step_cannot_be_re_executed() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"title": "A"}"#))]));
        let mut state = state(vec![step("prd", &[], true)]);
        h.executor.execute(&mut state, "prd", None, None).await.unwrap();

        let err = h.executor.execute(&mut state, "prd", None, None).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidState { status: StepStatus::Completed, .. }));
        assert!(matches!(
            h.executor.execute(&mut state, "nope", None, None).await,
            Err(StepError::UnknownStep(_))
        ));
    }

    #[tokio::test]
    async fn invalid_output_fails_without_persisting() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"summary": "no title"}"#))]));
        let mut state = state(vec![step("prd", &[], true)]);
        let mut sub = h.bus.subscribe(state.id);

        let result = h.executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::ValidationFailed);
        assert_eq!(result.errors, vec!["missing required field: title"]);
        assert_eq!(state.steps["prd"].status, StepStatus::Failed);
        assert!(h.documents.list_by_scope(&state.scope).await.unwrap().is_empty());
        assert!(drain(&mut sub).contains(&ProgressEventType::StepFailed));
    }

    #[tokio::test]
    async fn failed_step_may_be_executed_again() {
        let h = harness(ScriptedLlm::new(vec![
            Ok(ok_response("not json")),
            Ok(ok_response(r#"{"title": "Second try"}"#)),
        ]));
        let mut state = state(vec![step("prd", &[], false)]);
        h.executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(state.steps["prd"].status, StepStatus::Failed);

        let result = h.executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::Completed);
        assert_eq!(state.steps["prd"].attempt, 1, "attempt only grows on clarification resume");
    }

    #[tokio::test]
    async fn disallowed_clarification_is_treated_as_output() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response("What should the title be?"))]));
        let mut state = state(vec![step("prd", &[], false)]);

        let result = h.executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::ValidationFailed);
        assert!(result.questions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_exhaustion_is_an_operational_failure() {
        let llm = ScriptedLlm::new(vec![Err(server_error()), Err(server_error()), Err(server_error())]);
        let calls = llm.call_counter();
        let h = harness(llm);
        let mut state = state(vec![step("prd", &[], true)]);
        let mut sub = h.bus.subscribe(state.id);

        let result = h.executor.execute(&mut state, "prd", None, None).await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(result.outcome, StepOutcome::OperationalError);
        assert_eq!(result.user_message(), "temporarily unavailable, retry later");
        assert_eq!(result.telemetry.input_tokens, 0);
        assert_eq!(result.telemetry.attempts, 3);
        assert_eq!(result.telemetry.error_type.as_deref(), Some("server_error"));

        let progress = &state.steps["prd"];
        assert_eq!(progress.status, StepStatus::Failed);
        assert_eq!(progress.metadata["outcome"], "operational_error");
        assert_eq!(progress.metadata["operational_error"]["attempts"], 3);
        assert!(progress.metadata["operational_error"]["first_seen_at"].is_string());
        assert!(progress.error_message.as_deref().unwrap().contains("503"));

        let events = drain(&mut sub);
        assert!(events.contains(&ProgressEventType::StepFailed));
        assert!(!events.contains(&ProgressEventType::StepCompleted));
        assert!(!events.contains(&ProgressEventType::ClarificationNeeded));
    }

    #[tokio::test]
    async fn inputs_are_condensed_into_the_prompt() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen_in = Arc::clone(&seen);
        let llm = ScriptedLlm::routed(move |request| {
            *seen_in.lock().unwrap() = request_text(request);
            Ok(ok_response(r#"{"title": "PRD"}"#))
        });
        let h = harness(llm);
        let mut state = state(vec![step("prd", &["brief", "missing"], true)]);
        h.documents
            .save(Document::draft(
                state.scope.clone(),
                "brief",
                "Brief",
                json!("A very long product brief that exceeds the budget"),
            ))
            .await
            .unwrap();

        h.executor.execute(&mut state, "prd", None, None).await.unwrap();

        let prompt = seen.lock().unwrap().clone();
        assert!(prompt.contains("A very long product "));
        assert!(prompt.contains("[truncated]"));
        assert!(!prompt.contains("exceeds the budget"));
    }

    #[tokio::test]
    async fn ledger_records_each_phase_in_order() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"title": "A"}"#))]));
        let (thread, _) = h
            .threads
            .get_or_create_thread(NewThread::derived(
                "run_workflow",
                SpaceRef::new("project", "P1"),
                TargetRef::new("workflow", "prd"),
                "alice",
            ))
            .await
            .unwrap();
        let wi = h.threads.create_work_item(&thread.id, "project:P1:prd").await.unwrap();
        let scope = LedgerScope {
            thread_id: thread.id,
            work_item_id: wi.id,
        };
        let mut state = state(vec![step("prd", &[], true)]);

        h.executor.execute(&mut state, "prd", None, Some(&scope)).await.unwrap();

        let entries = h.threads.list_ledger(&thread.id, Some(&wi.id)).await.unwrap();
        let types: Vec<_> = entries.iter().map(|e| e.entry_type).collect();
        assert_eq!(
            types,
            vec![
                LedgerEntryType::Prompt,
                LedgerEntryType::Response,
                LedgerEntryType::ParseReport,
                LedgerEntryType::MutationReport,
            ]
        );
        assert_eq!(entries[1].payload["request_id"], "req_test");
        assert_eq!(entries[3].payload["version"], 1);
    }

    #[tokio::test]
    async fn cancelled_execution_gets_no_completion_event() {
        let cancellations = CancellationRegistry::new();
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"title": "A"}"#))]));
        let executor = h.executor.with_cancellations(cancellations.clone());
        let mut state = state(vec![step("prd", &[], true)]);
        let mut sub = h.bus.subscribe(state.id);
        cancellations.cancel(state.id);

        let result = executor.execute(&mut state, "prd", None, None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::Completed);
        let events = drain(&mut sub);
        assert!(events.contains(&ProgressEventType::StepCompleted));
        assert!(!events.contains(&ProgressEventType::ExecutionCompleted));
    }
}
