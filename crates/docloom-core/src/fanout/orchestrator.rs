//! Fan-out orchestrator: many independent units, one parent thread.
//!
//! Flow per run:
//! 1. Get or create the parent thread. A RUNNING parent reports `running`,
//!    a COMPLETE one `skipped`, a FAILED one `failed`; none reschedule.
//! 2. Skip units whose output document already exists.
//! 3. Spawn one task per remaining unit on a `JoinSet`, bounded by a
//!    `Semaphore`. Each unit gets its own child thread and work item, and
//!    runs the generation pipeline with retries independently.
//! 4. Collect every task. A unit failure (or panic) becomes a `UnitError`,
//!    closes that unit's child thread and work item, and never cancels its
//!    siblings.
//! 5. Write all successful units in one `save_batch`, then close the
//!    children and the parent. Unit errors are not fatal: the parent
//!    completes and the report says `completed_with_errors`.
//!
//! The run itself executes on a spawned task, so the parent thread settles
//! even if the caller stops polling.

use std::collections::HashMap;
use std::sync::Arc;

use docloom_types::document::Document;
use docloom_types::error::RepositoryError;
use docloom_types::event::{ProgressEvent, ProgressEventType};
use dashmap::DashMap;
use docloom_types::thread::{NewThread, TargetRef, Thread, ThreadStatus};
use futures_util::Stream;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

use super::types::{
    FanOutEvent, FanOutReport, FanOutRequest, FanOutStatus, FanOutUnit, UnitError, UnitResult,
};
use crate::event::bus::ProgressBus;
use crate::repository::document::DocumentRepository;
use crate::repository::thread::ThreadRepository;
use crate::step::executor::{GenerationOutcome, GenerationSpec, LedgerScope, StepExecutor};
use crate::step::prompt::CondensedInput;
use crate::thread::service::{ThreadError, ThreadService};

#[derive(Debug, thiserror::Error)]
pub enum FanOutError {
    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("fan-out run task failed: {0}")]
    Task(#[from] JoinError),
}

/// Successful unit awaiting the aggregate write.
struct UnitSuccess {
    unit: FanOutUnit,
    child_thread_id: Uuid,
    work_item_id: Uuid,
    items: Vec<serde_json::Value>,
}

/// Failed unit; thread and work item are already stamped.
struct UnitFailure {
    unit_id: String,
    error: String,
}

/// Records a unit's thread and work item as soon as they exist, so a
/// panicked task can still be closed.
#[derive(Debug, Clone, Copy)]
struct UnitIds {
    child_thread_id: Uuid,
    work_item_id: Option<Uuid>,
}

type UnitTracker = DashMap<String, UnitIds>;

/// Schedules fan-out units over a shared step executor.
pub struct FanOutOrchestrator<D: DocumentRepository, T: ThreadRepository> {
    executor: Arc<StepExecutor<D, T>>,
    threads: Arc<ThreadService<T>>,
    documents: Arc<D>,
    bus: ProgressBus,
    max_concurrency: usize,
}

impl<D: DocumentRepository, T: ThreadRepository> Clone for FanOutOrchestrator<D, T> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            threads: Arc::clone(&self.threads),
            documents: Arc::clone(&self.documents),
            bus: self.bus.clone(),
            max_concurrency: self.max_concurrency,
        }
    }
}

impl<D, T> FanOutOrchestrator<D, T>
where
    D: DocumentRepository + 'static,
    T: ThreadRepository + 'static,
{
    pub fn new(
        executor: Arc<StepExecutor<D, T>>,
        threads: Arc<ThreadService<T>>,
        documents: Arc<D>,
        bus: ProgressBus,
        max_concurrency: usize,
    ) -> Self {
        Self {
            executor,
            threads,
            documents,
            bus,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run every unit and return the aggregate report.
    ///
    /// Dropping the returned future does not abort the run.
    pub async fn run(&self, request: FanOutRequest) -> Result<FanOutReport, FanOutError> {
        let this = self.clone();
        tokio::spawn(async move { this.run_inner(request, None).await }).await?
    }

    /// Like [`run`](Self::run), but yields a `UnitComplete` / `UnitError` item as
    /// each unit settles (completion order), then `Finished` after the
    /// aggregate write. Unit events are also published on the progress bus
    /// under the parent thread id.
    ///
    /// The run starts on first poll. Dropping the stream afterwards stops
    /// delivery only; the run still settles every thread.
    pub fn run_streaming(
        &self,
        request: FanOutRequest,
    ) -> impl Stream<Item = Result<FanOutEvent, FanOutError>> + Send + use<D, T> {
        let this = self.clone();
        async_stream::stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = tokio::spawn(async move { this.run_inner(request, Some(tx)).await });

            // The sender lives in the run task; the channel closes when it returns.
            while let Some(event) = rx.recv().await {
                yield Ok(event);
            }
            yield match run.await {
                Ok(report) => report.map(FanOutEvent::Finished),
                Err(join_err) => Err(FanOutError::Task(join_err)),
            };
        }
    }

    async fn run_inner(
        &self,
        request: FanOutRequest,
        events: Option<mpsc::UnboundedSender<FanOutEvent>>,
    ) -> Result<FanOutReport, FanOutError> {
        let FanOutRequest {
            operation,
            space,
            target,
            created_by,
            units,
        } = request;

        let (parent, _created) = self
            .threads
            .get_or_create_thread(NewThread::derived(&operation, space, target, &created_by))
            .await?;

        if let Some(report) = self.report_without_scheduling(&parent).await? {
            return Ok(report);
        }
        match self.threads.start_thread(&parent.id).await {
            Ok(_) => {}
            // Another caller started it between our read and our CAS.
            Err(ThreadError::InvalidTransition(_)) => {
                let current = self.threads.get_thread(&parent.id).await?;
                if let Some(report) = self.report_without_scheduling(&current).await? {
                    return Ok(report);
                }
                return Ok(FanOutReport::without_scheduling(parent.id, FanOutStatus::Running, None));
            }
            Err(e) => return Err(e.into()),
        }

        // Unit-level idempotency: outputs that already exist are not regenerated.
        let mut pending = Vec::with_capacity(units.len());
        let mut skipped_units = Vec::new();
        for unit in units {
            let existing = self
                .documents
                .get_by_scope_type(&unit.scope, &unit.output_type, None)
                .await?;
            if existing.is_some() {
                skipped_units.push(unit.unit_id);
            } else {
                pending.push(unit);
            }
        }

        let processed = pending.len();
        tracing::info!(
            parent_thread_id = %parent.id,
            operation = %operation,
            processed,
            skipped = skipped_units.len(),
            max_concurrency = self.max_concurrency,
            "fan-out started"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let tracker: Arc<UnitTracker> = Arc::default();
        let mut join_set = JoinSet::new();
        let mut task_units: HashMap<tokio::task::Id, String> = HashMap::new();

        for unit in pending {
            let unit_id = unit.unit_id.clone();
            let executor = Arc::clone(&self.executor);
            let threads = Arc::clone(&self.threads);
            let semaphore = Arc::clone(&semaphore);
            let tracker = Arc::clone(&tracker);
            let operation = operation.clone();
            let created_by = created_by.clone();
            let parent_id = parent.id;

            let handle = join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| UnitFailure {
                    unit_id: unit.unit_id.clone(),
                    error: format!("scheduler closed: {e}"),
                })?;
                run_unit(&executor, &threads, &tracker, parent_id, &operation, &created_by, unit).await
            });
            task_units.insert(handle.id(), unit_id);
        }

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next_with_id().await {
            let outcome = match joined {
                Ok((_, Ok(success))) => Ok(success),
                Ok((_, Err(failure))) => Err(UnitError {
                    unit_id: failure.unit_id,
                    error: failure.error,
                }),
                Err(join_err) => {
                    let unit_id = task_units.get(&join_err.id()).cloned().unwrap_or_default();
                    let error = format!("unit task aborted: {join_err}");
                    let ids = tracker.get(&unit_id).map(|ids| *ids);
                    if let Some(ids) = ids {
                        close_unit(&self.threads, ids.child_thread_id, ids.work_item_id, "ABORTED", &error).await;
                    }
                    Err(UnitError { unit_id, error })
                }
            };

            match outcome {
                Ok(success) => {
                    self.emit_unit(
                        events.as_ref(),
                        parent.id,
                        FanOutEvent::UnitComplete {
                            unit_id: success.unit.unit_id.clone(),
                            items: success.items.len(),
                        },
                    );
                    successes.push(success);
                }
                Err(error) => {
                    tracing::warn!(
                        parent_thread_id = %parent.id,
                        unit_id = %error.unit_id,
                        error = %error.error,
                        "fan-out unit failed"
                    );
                    self.emit_unit(events.as_ref(), parent.id, FanOutEvent::UnitError(error.clone()));
                    errors.push(error);
                }
            }
        }

        let results = match self.write_results(successes).await {
            Ok(results) => results,
            Err(e) => {
                let reason = format!("aggregate write failed: {e}");
                if let Err(fail_err) = self.threads.fail_thread(&parent.id, &reason).await {
                    tracing::error!(parent_thread_id = %parent.id, error = %fail_err, "could not fail parent thread");
                }
                return Err(e);
            }
        };

        let generated = results.iter().map(|r| r.items.len()).sum();
        let status = if errors.is_empty() {
            FanOutStatus::Completed
        } else {
            FanOutStatus::CompletedWithErrors
        };
        self.threads.complete_thread(&parent.id).await?;

        let summary = self.threads.get_child_summary(&parent.id).await?;
        tracing::info!(
            parent_thread_id = %parent.id,
            status = %status,
            processed,
            generated,
            failed = errors.len(),
            "fan-out finished"
        );

        Ok(FanOutReport {
            parent_thread_id: parent.id,
            status,
            processed,
            generated,
            skipped_units,
            results,
            errors,
            summary: Some(summary),
        })
    }

    /// Report for a parent that must not be rescheduled, if any.
    async fn report_without_scheduling(&self, parent: &Thread) -> Result<Option<FanOutReport>, FanOutError> {
        let status = match parent.status {
            ThreadStatus::Pending => return Ok(None),
            ThreadStatus::Running => FanOutStatus::Running,
            ThreadStatus::Complete => FanOutStatus::Skipped,
            ThreadStatus::Failed => FanOutStatus::Failed,
        };
        tracing::info!(
            parent_thread_id = %parent.id,
            thread_status = %parent.status,
            status = %status,
            "fan-out not rescheduled"
        );
        let summary = match status {
            FanOutStatus::Running => None,
            _ => Some(self.threads.get_child_summary(&parent.id).await?),
        };
        Ok(Some(FanOutReport::without_scheduling(parent.id, status, summary)))
    }

    /// Single aggregate write of every successful unit, then close each child.
    async fn write_results(&self, successes: Vec<UnitSuccess>) -> Result<Vec<UnitResult>, FanOutError> {
        if successes.is_empty() {
            return Ok(Vec::new());
        }

        let drafts = successes
            .iter()
            .map(|s| {
                Document::draft(
                    s.unit.scope.clone(),
                    &s.unit.output_type,
                    format!("{} for {}", s.unit.output_type, s.unit.unit_id),
                    json!(s.items),
                )
            })
            .collect();

        let saved = match self.documents.save_batch(drafts).await {
            Ok(saved) => saved,
            Err(e) => {
                let reason = e.to_string();
                for success in &successes {
                    close_unit(
                        &self.threads,
                        success.child_thread_id,
                        Some(success.work_item_id),
                        "PERSIST_FAILED",
                        &reason,
                    )
                    .await;
                }
                return Err(e.into());
            }
        };

        let mut results = Vec::with_capacity(successes.len());
        for (success, document) in successes.into_iter().zip(saved) {
            let mutation = json!({
                "action": "document_saved",
                "document_id": document.id,
                "doc_type": document.doc_type,
                "version": document.version,
                "items": success.items.len(),
            });
            if let Err(e) = self
                .threads
                .record_mutation(&success.child_thread_id, &success.work_item_id, mutation)
                .await
            {
                tracing::warn!(error = %e, unit_id = %success.unit.unit_id, "failed to append ledger entry");
            }
            self.threads.apply_work_item(&success.work_item_id).await?;
            self.threads.complete_thread(&success.child_thread_id).await?;

            results.push(UnitResult {
                unit_id: success.unit.unit_id,
                child_thread_id: success.child_thread_id,
                items: success.items,
                document_id: Some(document.id),
            });
        }
        Ok(results)
    }

    fn emit_unit(&self, events: Option<&mpsc::UnboundedSender<FanOutEvent>>, parent_id: Uuid, event: FanOutEvent) {
        let progress = match &event {
            FanOutEvent::UnitComplete { unit_id, items } => {
                ProgressEvent::new(ProgressEventType::UnitComplete, parent_id)
                    .with_data(json!({ "unit_id": unit_id, "items": items }))
            }
            FanOutEvent::UnitError(error) => ProgressEvent::new(ProgressEventType::UnitError, parent_id)
                .with_data(json!({ "unit_id": error.unit_id, "error": error.error })),
            FanOutEvent::Finished(_) => return,
        };
        self.bus.publish(progress);
        if let Some(tx) = events {
            // A dropped stream only stops delivery; the run keeps going.
            let _ = tx.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-unit pipeline
// ---------------------------------------------------------------------------

async fn run_unit<D, T>(
    executor: &StepExecutor<D, T>,
    threads: &ThreadService<T>,
    tracker: &UnitTracker,
    parent_id: Uuid,
    operation: &str,
    created_by: &str,
    unit: FanOutUnit,
) -> Result<UnitSuccess, UnitFailure>
where
    D: DocumentRepository,
    T: ThreadRepository,
{
    let fail = |error: String| UnitFailure {
        unit_id: unit.unit_id.clone(),
        error,
    };

    let child_request = NewThread::derived(
        &format!("{operation}.unit"),
        unit.scope.clone(),
        TargetRef::new(&unit.output_type, &unit.unit_id),
        created_by,
    )
    .with_parent(parent_id);
    let (child, _) = threads
        .get_or_create_thread(child_request)
        .await
        .map_err(|e| fail(e.to_string()))?;

    // A child that failed in an earlier run is retried under the same key.
    if child.status == ThreadStatus::Failed {
        threads.reset_thread(&child.id).await.map_err(|e| fail(e.to_string()))?;
    }
    threads.start_thread(&child.id).await.map_err(|e| fail(e.to_string()))?;
    tracker.insert(
        unit.unit_id.clone(),
        UnitIds {
            child_thread_id: child.id,
            work_item_id: None,
        },
    );

    let work_item = match threads.create_work_item(&child.id, &unit.lock_scope()).await {
        Ok(wi) => wi,
        Err(e) => {
            let error = e.to_string();
            close_unit(threads, child.id, None, "SCHEDULING", &error).await;
            return Err(fail(error));
        }
    };
    tracker.insert(
        unit.unit_id.clone(),
        UnitIds {
            child_thread_id: child.id,
            work_item_id: Some(work_item.id),
        },
    );
    let prepared = async {
        threads.claim_work_item(&work_item.id).await?;
        threads.start_work_item(&work_item.id).await
    }
    .await;
    if let Err(e) = prepared {
        let error = e.to_string();
        close_unit(threads, child.id, Some(work_item.id), "SCHEDULING", &error).await;
        return Err(fail(error));
    }

    let max_chars = executor.settings().max_input_chars;
    let inputs = unit
        .inputs
        .iter()
        .map(|i| CondensedInput::condense(&i.doc_type, &i.title, &i.content, max_chars))
        .collect();
    let ledger = LedgerScope {
        thread_id: child.id,
        work_item_id: work_item.id,
    };
    let generation = executor
        .generate(
            GenerationSpec {
                label: &unit.unit_id,
                role: &unit.role,
                task: &unit.task,
                output_type: &unit.output_type,
                inputs,
                context: None,
                answers: &[],
                schema: unit.schema.as_ref(),
                required_fields: &[],
                check_clarification: false,
            },
            Some(&ledger),
        )
        .await;

    let (code, error) = match generation.outcome {
        GenerationOutcome::Parsed(value) => match extract_items(value) {
            Ok(items) => {
                return Ok(UnitSuccess {
                    child_thread_id: child.id,
                    work_item_id: work_item.id,
                    items,
                    unit,
                });
            }
            Err(error) => ("VALIDATION_FAILED", error),
        },
        GenerationOutcome::Invalid(errors) => ("VALIDATION_FAILED", errors.join("; ")),
        GenerationOutcome::Unavailable(op_err) => ("OPERATIONAL_ERROR", op_err.to_string()),
        GenerationOutcome::Clarification(c) => ("CLARIFICATION", c.questions.join(" ")),
    };

    close_unit(threads, child.id, Some(work_item.id), code, &error).await;
    Err(fail(error))
}

/// Fail a unit's work item (when it has one) and its child thread.
async fn close_unit<T: ThreadRepository>(
    threads: &ThreadService<T>,
    child_thread_id: Uuid,
    work_item_id: Option<Uuid>,
    code: &str,
    reason: &str,
) {
    if let Some(work_item_id) = work_item_id {
        if let Err(e) = threads.fail_work_item(&work_item_id, code, reason).await {
            tracing::warn!(work_item_id = %work_item_id, error = %e, "could not fail work item");
        }
    }
    if let Err(e) = threads.fail_thread(&child_thread_id, reason).await {
        tracing::warn!(thread_id = %child_thread_id, error = %e, "could not fail child thread");
    }
}

/// Sub-results are a JSON array, or an object holding an `items` array.
fn extract_items(value: serde_json::Value) -> Result<Vec<serde_json::Value>, String> {
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut obj) => match obj.remove("items") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err("expected an object with an `items` array".to_string()),
        },
        _ => Err("expected a JSON array of items".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
