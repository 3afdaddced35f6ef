//! Execution service: the surface presentation layers call.
//!
//! An execution is one run of a workflow against a scope, owned by a thread
//! keyed `run_workflow:{scope}:workflow:{workflow_id}:{request_key}`. Each
//! step invocation gets its own work item; a step paused for clarification
//! keeps its work item open until the resume settles it.
//!
//! Status flow:
//!
//! ```text
//! running --step completed--> running | completed (terminal step)
//!         --clarification---> waiting_input --continue--> running ...
//!         --step failed-----> failed
//! any non-terminal --cancel--> cancelled
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docloom_types::error::RepositoryError;
use docloom_types::event::{ProgressEvent, ProgressEventType};
use docloom_types::execution::{
    ClarificationAnswer, ExecutionState, ExecutionStatus, StepOutcome, WorkflowDefinition,
};
use docloom_types::thread::{NewThread, SpaceRef, TargetRef, WorkItem, WorkItemStatus};
use futures_util::Stream;
use serde_json::json;
use uuid::Uuid;

use super::cancel::CancellationRegistry;
use crate::event::bus::ProgressBus;
use crate::event::stream::progress_stream;
use crate::repository::document::DocumentRepository;
use crate::repository::execution::ExecutionRepository;
use crate::repository::thread::ThreadRepository;
use crate::step::executor::{LedgerScope, StepError, StepExecutor, StepResult};
use crate::thread::service::{ThreadError, ThreadService};

/// Thread operation name for workflow runs.
const RUN_WORKFLOW: &str = "run_workflow";

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {execution_id} is already {status}")]
    Terminal {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("execution for thread {0} is being started by another caller")]
    StartInProgress(Uuid),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Request to start (or look up) a workflow execution.
#[derive(Debug, Clone)]
pub struct StartExecution {
    pub workflow: WorkflowDefinition,
    pub scope: SpaceRef,
    /// Caller-chosen key; repeating it returns the existing execution.
    pub request_key: String,
    pub created_by: String,
}

pub struct ExecutionService<D, T, E>
where
    D: DocumentRepository,
    T: ThreadRepository,
    E: ExecutionRepository,
{
    executor: Arc<StepExecutor<D, T>>,
    threads: Arc<ThreadService<T>>,
    executions: Arc<E>,
    bus: ProgressBus,
    cancellations: CancellationRegistry,
    keepalive: Duration,
}

impl<D, T, E> ExecutionService<D, T, E>
where
    D: DocumentRepository,
    T: ThreadRepository,
    E: ExecutionRepository,
{
    /// The bus and cancellation registry are taken from `executor` so both
    /// sides observe the same cancellations.
    pub fn new(
        executor: Arc<StepExecutor<D, T>>,
        threads: Arc<ThreadService<T>>,
        executions: Arc<E>,
        keepalive: Duration,
    ) -> Self {
        Self {
            bus: executor.bus().clone(),
            cancellations: executor.cancellations().clone(),
            executor,
            threads,
            executions,
            keepalive,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start an execution, or return the one already started for this key.
    pub async fn start_execution(&self, request: StartExecution) -> Result<ExecutionState, ExecutionError> {
        let StartExecution {
            workflow,
            scope,
            request_key,
            created_by,
        } = request;

        let target = TargetRef::new("workflow", format!("{}:{request_key}", workflow.id));
        let (thread, created) = self
            .threads
            .get_or_create_thread(NewThread::derived(RUN_WORKFLOW, scope.clone(), target, &created_by))
            .await?;

        if let Some(existing) = self.executions.get_by_thread(&thread.id).await? {
            tracing::debug!(
                execution_id = %existing.id,
                thread_id = %thread.id,
                status = %existing.status,
                "execution already exists for request key"
            );
            return Ok(existing);
        }

        // Whoever moves the thread out of PENDING owns creating the execution.
        match self.threads.start_thread(&thread.id).await {
            Ok(_) => {}
            Err(ThreadError::InvalidTransition(_)) => {
                return match self.executions.get_by_thread(&thread.id).await? {
                    Some(existing) => Ok(existing),
                    None => Err(ExecutionError::StartInProgress(thread.id)),
                };
            }
            Err(e) => return Err(e.into()),
        }

        let mut state = ExecutionState::new(thread.id, workflow, scope, created_by);
        state.status = ExecutionStatus::Running;
        self.executions.save(&state).await?;

        tracing::info!(
            execution_id = %state.id,
            thread_id = %thread.id,
            workflow_id = %state.workflow.id,
            scope = %state.scope,
            new_thread = created,
            "execution started"
        );
        self.bus.publish(
            ProgressEvent::new(ProgressEventType::ExecutionStarted, state.id).with_data(json!({
                "workflow_id": state.workflow.id,
                "scope": state.scope.to_string(),
                "steps": state.workflow.steps.iter().map(|s| &s.id).collect::<Vec<_>>(),
            })),
        );
        Ok(state)
    }

    /// Run one `pending` or `failed` step of an execution.
    pub async fn execute_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        extra_context: Option<&serde_json::Value>,
    ) -> Result<StepResult, ExecutionError> {
        let _in_flight = self.cancellations.track(*execution_id);
        let mut state = self.load_active(execution_id).await?;
        let lock_scope = Self::lock_scope(&state, step_id)?;

        let work_item = self.threads.create_work_item(&state.thread_id, &lock_scope).await?;
        self.threads.claim_work_item(&work_item.id).await?;
        self.threads.start_work_item(&work_item.id).await?;

        let previous = state.status;
        state.status = ExecutionStatus::Running;
        self.executions.save(&state).await?;

        let ledger = LedgerScope {
            thread_id: state.thread_id,
            work_item_id: work_item.id,
        };
        let run = self
            .executor
            .execute(&mut state, step_id, extra_context, Some(&ledger))
            .await;
        self.settle(state, previous, &work_item, run).await
    }

    /// Resume a step paused in `waiting_input` with the user's answers.
    pub async fn continue_with_clarification(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        answers: &[ClarificationAnswer],
    ) -> Result<StepResult, ExecutionError> {
        let _in_flight = self.cancellations.track(*execution_id);
        let mut state = self.load_active(execution_id).await?;
        let lock_scope = Self::lock_scope(&state, step_id)?;

        // The pause kept the step's work item open; resume on it so the whole
        // exchange shares one ledger trail.
        let work_item = match self.open_work_item(&state.thread_id, &lock_scope).await? {
            Some(wi) => wi,
            None => {
                let wi = self.threads.create_work_item(&state.thread_id, &lock_scope).await?;
                self.threads.claim_work_item(&wi.id).await?;
                self.threads.start_work_item(&wi.id).await?
            }
        };

        let previous = state.status;
        state.status = ExecutionStatus::Running;
        self.executions.save(&state).await?;

        let ledger = LedgerScope {
            thread_id: state.thread_id,
            work_item_id: work_item.id,
        };
        let run = self
            .executor
            .continue_with_clarification(&mut state, step_id, answers, None, Some(&ledger))
            .await;
        self.settle(state, previous, &work_item, run).await
    }

    /// Cancel a non-terminal execution.
    ///
    /// In-flight provider calls are not aborted; a step that finishes later
    /// records its progress but leaves the execution `cancelled`.
    pub async fn cancel_execution(&self, execution_id: &Uuid) -> Result<ExecutionState, ExecutionError> {
        let mut state = self.load_active(execution_id).await?;
        let was_waiting = state.status == ExecutionStatus::WaitingInput;

        self.cancellations.cancel(state.id);
        let now = Utc::now();
        state.status = ExecutionStatus::Cancelled;
        state.completed_at = Some(now);
        state.updated_at = now;
        self.executions.save(&state).await?;
        self.cancellations.release_if_idle(&state.id);
        self.threads.fail_thread(&state.thread_id, "cancelled").await?;

        // Nothing is in flight for a paused step, so its work item can be closed now.
        if was_waiting {
            for wi in self.threads.list_work_items(&state.thread_id).await? {
                if !wi.status.is_terminal() {
                    self.threads
                        .fail_work_item(&wi.id, "CANCELLED", "execution cancelled")
                        .await?;
                }
            }
        }

        tracing::info!(execution_id = %state.id, thread_id = %state.thread_id, "execution cancelled");
        self.bus.publish(
            ProgressEvent::new(ProgressEventType::ExecutionCancelled, state.id)
                .with_data(json!({ "current_step": state.current_step })),
        );
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, execution_id: &Uuid) -> Result<ExecutionState, ExecutionError> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or(ExecutionError::NotFound(*execution_id))
    }

    /// Executions in a scope, newest first.
    pub async fn list_executions(&self, scope: &SpaceRef) -> Result<Vec<ExecutionState>, ExecutionError> {
        Ok(self.executions.list_by_scope(scope).await?)
    }

    pub async fn list_active(&self) -> Result<Vec<ExecutionState>, ExecutionError> {
        Ok(self.executions.list_active().await?)
    }

    /// SSE frames for an execution, starting with `connected`.
    ///
    /// The subscription is registered before this returns, so no event
    /// published afterwards is missed.
    pub async fn stream_progress(
        &self,
        execution_id: &Uuid,
    ) -> Result<impl Stream<Item = String> + Send + use<D, T, E>, ExecutionError> {
        let state = self.get_execution(execution_id).await?;
        if state.status.is_terminal() {
            tracing::debug!(
                execution_id = %execution_id,
                status = %state.status,
                "streaming progress of a finished execution"
            );
        }
        Ok(progress_stream(self.bus.subscribe(state.id), self.keepalive))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load_active(&self, execution_id: &Uuid) -> Result<ExecutionState, ExecutionError> {
        let state = self.get_execution(execution_id).await?;
        if state.status.is_terminal() || self.cancellations.is_cancelled(&state.id) {
            return Err(ExecutionError::Terminal {
                execution_id: state.id,
                status: state.status,
            });
        }
        Ok(state)
    }

    fn lock_scope(state: &ExecutionState, step_id: &str) -> Result<String, ExecutionError> {
        let step = state
            .workflow
            .step(step_id)
            .ok_or_else(|| StepError::UnknownStep(step_id.to_string()))?;
        Ok(format!("{}:{}", state.scope, step.output_type))
    }

    async fn open_work_item(&self, thread_id: &Uuid, lock_scope: &str) -> Result<Option<WorkItem>, ExecutionError> {
        let items = self.threads.list_work_items(thread_id).await?;
        Ok(items
            .into_iter()
            .rev()
            .find(|wi| wi.lock_scope == lock_scope && wi.status == WorkItemStatus::Running))
    }

    /// Stamp the work item, derive the execution status from the step outcome
    /// and persist. A cancellation that landed while the step ran wins.
    async fn settle(
        &self,
        mut state: ExecutionState,
        previous: ExecutionStatus,
        work_item: &WorkItem,
        run: Result<StepResult, StepError>,
    ) -> Result<StepResult, ExecutionError> {
        let result = match run {
            Ok(result) => result,
            Err(e) => {
                if let Err(stamp_err) = self
                    .threads
                    .fail_work_item(&work_item.id, "STEP_REJECTED", &e.to_string())
                    .await
                {
                    tracing::warn!(work_item_id = %work_item.id, error = %stamp_err, "could not fail work item");
                }
                if !self.cancellations.is_cancelled(&state.id) {
                    state.status = previous;
                    self.executions.save(&state).await?;
                }
                return Err(e.into());
            }
        };

        self.stamp_work_item(work_item, &result).await;

        let stored = self.executions.get(&state.id).await?;
        let cancelled = self.cancellations.is_cancelled(&state.id)
            || stored.as_ref().is_some_and(|s| s.status == ExecutionStatus::Cancelled);
        if cancelled {
            let stored_completed_at = stored.and_then(|s| s.completed_at);
            state.status = ExecutionStatus::Cancelled;
            state.completed_at = stored_completed_at.or(state.completed_at);
            self.executions.save(&state).await?;
            tracing::info!(
                execution_id = %state.id,
                step_id = %result.step_id,
                outcome = %result.outcome,
                "step finished after cancellation"
            );
            return Ok(result);
        }

        match result.outcome {
            StepOutcome::Completed if state.workflow.is_terminal_step(&result.step_id) => {
                let now = Utc::now();
                state.status = ExecutionStatus::Completed;
                state.completed_at = Some(now);
                state.updated_at = now;
                self.threads.complete_thread(&state.thread_id).await?;
                tracing::info!(execution_id = %state.id, "execution completed");
            }
            StepOutcome::Completed => state.status = ExecutionStatus::Running,
            StepOutcome::WaitingInput => state.status = ExecutionStatus::WaitingInput,
            StepOutcome::ValidationFailed | StepOutcome::OperationalError => {
                let now = Utc::now();
                let reason = format!("step '{}' failed: {}", result.step_id, result.errors.join("; "));
                state.status = ExecutionStatus::Failed;
                state.completed_at = Some(now);
                state.updated_at = now;
                self.threads.fail_thread(&state.thread_id, &reason).await?;

                tracing::warn!(
                    execution_id = %state.id,
                    step_id = %result.step_id,
                    outcome = %result.outcome,
                    "execution failed"
                );
                self.bus.publish(
                    ProgressEvent::new(ProgressEventType::ExecutionFailed, state.id)
                        .with_step(&result.step_id)
                        .with_data(json!({
                            "outcome": result.outcome.to_string(),
                            "errors": result.errors,
                            "user_message": result.user_message(),
                        })),
                );
            }
        }

        self.executions.save(&state).await?;
        Ok(result)
    }

    async fn stamp_work_item(&self, work_item: &WorkItem, result: &StepResult) {
        let stamped = match result.outcome {
            StepOutcome::Completed => self.threads.apply_work_item(&work_item.id).await,
            // Stays open until the clarification resume settles it.
            StepOutcome::WaitingInput => return,
            StepOutcome::ValidationFailed => {
                self.threads
                    .fail_work_item(&work_item.id, "VALIDATION_FAILED", &result.errors.join("; "))
                    .await
            }
            StepOutcome::OperationalError => {
                self.threads
                    .fail_work_item(&work_item.id, "OPERATIONAL_ERROR", &result.errors.join("; "))
                    .await
            }
        };
        if let Err(e) = stamped {
            tracing::warn!(work_item_id = %work_item.id, error = %e, "could not stamp work item");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::box_provider::BoxLlmProvider;
    use crate::llm::provider::LlmProvider;
    use crate::llm::retry::RetryPolicy;
    use crate::repository::memory::{
        InMemoryDocumentRepository, InMemoryExecutionRepository, InMemoryThreadRepository,
    };
    use crate::step::executor::GenerationSettings;
    use crate::test_support::{ScriptedLlm, ok_response, server_error};
    use docloom_types::execution::{StepDefinition, StepStatus};
    use docloom_types::llm::{CompletionRequest, CompletionResponse, LlmError};
    use docloom_types::thread::ThreadStatus;
    use futures_util::StreamExt;
    use tokio::sync::Notify;

    type Service = ExecutionService<InMemoryDocumentRepository, InMemoryThreadRepository, InMemoryExecutionRepository>;

    struct Harness {
        service: Arc<Service>,
        threads: Arc<ThreadService<InMemoryThreadRepository>>,
        bus: ProgressBus,
    }

    fn harness<P: LlmProvider + 'static>(provider: P) -> Harness {
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let threads = Arc::new(ThreadService::new(InMemoryThreadRepository::new()));
        let bus = ProgressBus::new();
        let executor = Arc::new(
            StepExecutor::new(
                Arc::new(BoxLlmProvider::new(provider)),
                documents,
                Arc::clone(&threads),
                bus.clone(),
                GenerationSettings::default(),
            )
            .with_retry_policy(RetryPolicy::new(0, Duration::from_millis(1))),
        );
        let service = ExecutionService::new(
            executor,
            Arc::clone(&threads),
            Arc::new(InMemoryExecutionRepository::new()),
            Duration::from_secs(15),
        );
        Harness {
            service: Arc::new(service),
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

    fn start_request(request_key: &str) -> StartExecution {
        StartExecution {
            workflow: WorkflowDefinition {
                id: "prd".to_string(),
                name: "Product requirements".to_string(),
                steps: vec![step("brief", &[], true), step("prd", &["brief"], false)],
            },
            scope: SpaceRef::new("project", "P1"),
            request_key: request_key.to_string(),
            created_by: "alice".to_string(),
        }
    }

    fn doc(title: &str) -> Result<CompletionResponse, LlmError> {
        Ok(ok_response(&format!(r#"{{"title": "{title}"}}"#)))
    }

    #[tokio::test]
    async fn start_is_idempotent_per_request_key() {
        let h = harness(ScriptedLlm::new(vec![]));

        let first = h.service.start_execution(start_request("r1")).await.unwrap();
        let again = h.service.start_execution(start_request("r1")).await.unwrap();
        let other = h.service.start_execution(start_request("r2")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.status, ExecutionStatus::Running);

        let thread = h.threads.get_thread(&first.thread_id).await.unwrap();
        assert_eq!(thread.idempotency_key.as_str(), "run_workflow:project:P1:workflow:prd:r1");
        assert_eq!(thread.status, ThreadStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_execution() {
        let h = harness(ScriptedLlm::new(vec![]));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = Arc::clone(&h.service);
            handles.push(tokio::spawn(async move { service.start_execution(start_request("dup")).await }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(state) => ids.push(state.id),
                Err(ExecutionError::StartInProgress(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let listed = h.service.list_executions(&SpaceRef::new("project", "P1")).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn running_every_step_completes_execution_and_thread() {
        let h = harness(ScriptedLlm::new(vec![doc("Brief"), doc("PRD")]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();

        let brief = h.service.execute_step(&state.id, "brief", None).await.unwrap();
        assert_eq!(brief.outcome, StepOutcome::Completed);
        assert_eq!(h.service.get_execution(&state.id).await.unwrap().status, ExecutionStatus::Running);

        h.service.execute_step(&state.id, "prd", None).await.unwrap();
        let done = h.service.get_execution(&state.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());

        let thread = h.threads.get_thread(&state.thread_id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::Complete);
        let items = h.threads.list_work_items(&state.thread_id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|wi| wi.status == WorkItemStatus::Applied));
        assert_eq!(items[1].lock_scope, "project:P1:prd");

        let err = h.service.execute_step(&state.id, "prd", None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Terminal { status: ExecutionStatus::Completed, .. }));
    }

    #[tokio::test]
    async fn clarification_pauses_and_resumes_on_the_same_work_item() {
        let h = harness(ScriptedLlm::new(vec![
            Ok(ok_response("Who is the primary persona?")),
            doc("Brief"),
        ]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();

        let paused = h.service.execute_step(&state.id, "brief", None).await.unwrap();
        assert_eq!(paused.outcome, StepOutcome::WaitingInput);
        assert_eq!(paused.questions, vec!["Who is the primary persona?"]);
        assert_eq!(
            h.service.get_execution(&state.id).await.unwrap().status,
            ExecutionStatus::WaitingInput
        );

        let answers = vec![ClarificationAnswer {
            question: "Who is the primary persona?".to_string(),
            answer: "Team leads".to_string(),
        }];
        let resumed = h
            .service
            .continue_with_clarification(&state.id, "brief", &answers)
            .await
            .unwrap();
        assert_eq!(resumed.outcome, StepOutcome::Completed);

        let after = h.service.get_execution(&state.id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Running);
        assert_eq!(after.steps["brief"].attempt, 2);

        let items = h.threads.list_work_items(&state.thread_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, WorkItemStatus::Applied);
    }

    #[tokio::test]
    async fn invalid_output_fails_execution_and_thread() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response(r#"{"summary": "no title"}"#))]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();
        let mut sub = h.bus.subscribe(state.id);

        let result = h.service.execute_step(&state.id, "brief", None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::ValidationFailed);

        let failed = h.service.get_execution(&state.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        let thread = h.threads.get_thread(&state.thread_id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::Failed);
        assert!(thread.failure_reason.unwrap().contains("missing required field: title"));

        let items = h.threads.list_work_items(&state.thread_id).await.unwrap();
        assert_eq!(items[0].status, WorkItemStatus::Failed);
        assert_eq!(items[0].error_code.as_deref(), Some("VALIDATION_FAILED"));

        let mut types = Vec::new();
        while let Some(event) = sub.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types.last(), Some(&ProgressEventType::ExecutionFailed));
    }

    #[tokio::test]
    async fn operational_error_fails_with_dedicated_outcome() {
        let h = harness(ScriptedLlm::new(vec![Err(server_error())]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();

        let result = h.service.execute_step(&state.id, "brief", None).await.unwrap();
        assert_eq!(result.outcome, StepOutcome::OperationalError);
        assert_eq!(result.user_message(), "temporarily unavailable, retry later");

        let failed = h.service.get_execution(&state.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.steps["brief"].metadata.contains_key("operational_error"));
        let items = h.threads.list_work_items(&state.thread_id).await.unwrap();
        assert_eq!(items[0].error_code.as_deref(), Some("OPERATIONAL_ERROR"));
    }

    #[tokio::test]
    async fn unknown_step_is_rejected_without_a_work_item() {
        let h = harness(ScriptedLlm::new(vec![]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();

        let err = h.service.execute_step(&state.id, "nope", None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Step(StepError::UnknownStep(_))));
        assert!(h.threads.list_work_items(&state.thread_id).await.unwrap().is_empty());

        let missing = h.service.execute_step(&Uuid::now_v7(), "brief", None).await.unwrap_err();
        assert!(matches!(missing, ExecutionError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_fails_thread_and_blocks_further_steps() {
        let h = harness(ScriptedLlm::new(vec![]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();
        let mut sub = h.bus.subscribe(state.id);

        let cancelled = h.service.cancel_execution(&state.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        // Nothing was in flight, so the stored status alone guards the execution.
        assert!(h.service.cancellations.is_empty());

        let thread = h.threads.get_thread(&state.thread_id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::Failed);
        assert_eq!(thread.failure_reason.as_deref(), Some("cancelled"));

        assert!(matches!(
            h.service.cancel_execution(&state.id).await.unwrap_err(),
            ExecutionError::Terminal { status: ExecutionStatus::Cancelled, .. }
        ));
        assert!(matches!(
            h.service.execute_step(&state.id, "brief", None).await.unwrap_err(),
            ExecutionError::Terminal { .. }
        ));

        let mut last = None;
        while let Some(event) = sub.try_recv() {
            last = Some(event.event_type);
        }
        assert_eq!(last, Some(ProgressEventType::ExecutionCancelled));
        assert!(h.service.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_paused_step_closes_its_work_item() {
        let h = harness(ScriptedLlm::new(vec![Ok(ok_response("What is the budget?"))]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();
        h.service.execute_step(&state.id, "brief", None).await.unwrap();

        h.service.cancel_execution(&state.id).await.unwrap();
        let items = h.threads.list_work_items(&state.thread_id).await.unwrap();
        assert_eq!(items[0].status, WorkItemStatus::Failed);
        assert_eq!(items[0].error_code.as_deref(), Some("CANCELLED"));
    }

    /// Blocks each call until released, so a cancel can land mid-step.
    struct GatedLlm {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl LlmProvider for GatedLlm {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.started.notify_one();
            self.release.notified().await;
            doc("Brief")
        }
    }

    #[tokio::test]
    async fn step_finishing_after_cancel_keeps_execution_cancelled() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let h = harness(GatedLlm {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let mut request = start_request("r1");
        request.workflow.steps.truncate(1);
        let state = h.service.start_execution(request).await.unwrap();
        let mut sub = h.bus.subscribe(state.id);

        let service = Arc::clone(&h.service);
        let id = state.id;
        let in_flight = tokio::spawn(async move { service.execute_step(&id, "brief", None).await });

        started.notified().await;
        h.service.cancel_execution(&state.id).await.unwrap();
        assert!(h.service.cancellations.is_cancelled(&state.id));
        release.notify_one();

        let result = in_flight.await.unwrap().unwrap();
        assert_eq!(result.outcome, StepOutcome::Completed);
        assert!(h.service.cancellations.is_empty());

        let after = h.service.get_execution(&state.id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert_eq!(after.steps["brief"].status, StepStatus::Completed);

        let mut types = Vec::new();
        while let Some(event) = sub.try_recv() {
            types.push(event.event_type);
        }
        assert!(types.contains(&ProgressEventType::ExecutionCancelled));
        assert!(!types.contains(&ProgressEventType::ExecutionCompleted));
    }

    #[tokio::test]
    async fn progress_stream_replays_steps_and_closes_on_completion() {
        let h = harness(ScriptedLlm::new(vec![doc("Brief"), doc("PRD")]));
        let state = h.service.start_execution(start_request("r1")).await.unwrap();
        let stream = h.service.stream_progress(&state.id).await.unwrap();

        h.service.execute_step(&state.id, "brief", None).await.unwrap();
        h.service.execute_step(&state.id, "prd", None).await.unwrap();

        let frames: Vec<String> = stream.collect().await;
        let kinds: Vec<&str> = frames
            .iter()
            .map(|f| f.lines().next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(
            kinds,
            vec![
                "connected",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "execution_completed",
            ]
        );
        assert_eq!(h.bus.subscriber_count(&state.id), 0);
    }
}
