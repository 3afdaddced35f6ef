//! Thread service: the idempotency gate and audit trail of the engine.
//!
//! `get_or_create_thread` collapses repeated requests for the same
//! idempotency key onto one `Thread`. Status changes go through the
//! repository's compare-and-set so that racing callers cannot both start, or
//! both close, the same thread.

use docloom_types::error::RepositoryError;
use docloom_types::thread::{
    LedgerEntry, LedgerEntryType, NewThread, Thread, ThreadChildSummary, ThreadStatus, WorkItem,
    WorkItemStatus,
};
use uuid::Uuid;

use crate::repository::thread::ThreadRepository;

/// Errors from thread and work item operations.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("thread not found: {0}")]
    NotFound(Uuid),

    #[error("work item not found: {0}")]
    WorkItemNotFound(Uuid),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("failing a work item requires an error code and message")]
    MissingFailureDetail,

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for ThreadError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => ThreadError::InvalidTransition(msg),
            other => ThreadError::Repository(other),
        }
    }
}

/// Thread, work item and ledger operations over a [`ThreadRepository`].
pub struct ThreadService<R: ThreadRepository> {
    repo: R,
}

impl<R: ThreadRepository> ThreadService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Return the thread for `request.idempotency_key`, creating it if absent.
    ///
    /// The boolean is `true` only for the caller whose request created it.
    pub async fn get_or_create_thread(&self, request: NewThread) -> Result<(Thread, bool), ThreadError> {
        if let Some(existing) = self.repo.get_thread_by_key(&request.idempotency_key).await? {
            tracing::debug!(
                thread_id = %existing.id,
                key = %existing.idempotency_key,
                status = %existing.status,
                "reusing existing thread"
            );
            return Ok((existing, false));
        }

        let (thread, created) = self.repo.insert_thread_if_absent(request.into_thread()).await?;
        if created {
            tracing::info!(
                thread_id = %thread.id,
                kind = %thread.kind,
                key = %thread.idempotency_key,
                parent = ?thread.parent_thread_id,
                "thread created"
            );
        } else {
            tracing::debug!(thread_id = %thread.id, "lost create race, reusing thread");
        }
        Ok((thread, created))
    }

    pub async fn get_thread(&self, id: &Uuid) -> Result<Thread, ThreadError> {
        self.repo.get_thread(id).await?.ok_or(ThreadError::NotFound(*id))
    }

    /// PENDING -> RUNNING.
    pub async fn start_thread(&self, id: &Uuid) -> Result<Thread, ThreadError> {
        let thread = self
            .transition(id, &[ThreadStatus::Pending], ThreadStatus::Running, None)
            .await?;
        tracing::info!(thread_id = %id, "thread running");
        Ok(thread)
    }

    /// RUNNING -> COMPLETE, stamping `closed_at`.
    pub async fn complete_thread(&self, id: &Uuid) -> Result<Thread, ThreadError> {
        let thread = self
            .transition(id, &[ThreadStatus::Running], ThreadStatus::Complete, None)
            .await?;
        tracing::info!(thread_id = %id, "thread complete");
        Ok(thread)
    }

    /// PENDING or RUNNING -> FAILED, stamping `closed_at`.
    pub async fn fail_thread(&self, id: &Uuid, reason: &str) -> Result<Thread, ThreadError> {
        let thread = self
            .transition(
                id,
                &[ThreadStatus::Pending, ThreadStatus::Running],
                ThreadStatus::Failed,
                Some(reason),
            )
            .await?;
        tracing::warn!(thread_id = %id, reason, "thread failed");
        Ok(thread)
    }

    /// FAILED -> PENDING so the same key can be attempted again.
    pub async fn reset_thread(&self, id: &Uuid) -> Result<Thread, ThreadError> {
        let thread = self
            .transition(id, &[ThreadStatus::Failed], ThreadStatus::Pending, None)
            .await?;
        tracing::info!(thread_id = %id, "thread reset to pending");
        Ok(thread)
    }

    async fn transition(
        &self,
        id: &Uuid,
        expected: &[ThreadStatus],
        to: ThreadStatus,
        reason: Option<&str>,
    ) -> Result<Thread, ThreadError> {
        match self.repo.update_thread_status(id, expected, to, reason).await {
            Ok(thread) => Ok(thread),
            Err(RepositoryError::NotFound) => Err(ThreadError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Aggregate statuses of every child thread under `parent_id`.
    pub async fn get_child_summary(&self, parent_id: &Uuid) -> Result<ThreadChildSummary, ThreadError> {
        let children = self.repo.list_child_threads(parent_id).await?;
        Ok(ThreadChildSummary::from_statuses(children.iter().map(|t| t.status)))
    }

    // -----------------------------------------------------------------------
    // Work items
    // -----------------------------------------------------------------------

    /// Create the next work item for a thread.
    ///
    /// `lock_scope` is advisory: a concurrent holder is logged, not blocked.
    pub async fn create_work_item(&self, thread_id: &Uuid, lock_scope: &str) -> Result<WorkItem, ThreadError> {
        let holders = self.repo.list_open_work_items_by_scope(lock_scope).await?;
        if let Some(holder) = holders.first() {
            tracing::warn!(
                thread_id = %thread_id,
                lock_scope,
                holder_work_item = %holder.id,
                holder_thread = %holder.thread_id,
                "another open work item already targets this scope"
            );
        }

        let item = match self.repo.create_work_item(thread_id, lock_scope).await {
            Ok(item) => item,
            Err(RepositoryError::NotFound) => return Err(ThreadError::NotFound(*thread_id)),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            thread_id = %thread_id,
            work_item_id = %item.id,
            sequence = item.sequence,
            lock_scope,
            "work item created"
        );
        Ok(item)
    }

    pub async fn get_work_item(&self, id: &Uuid) -> Result<WorkItem, ThreadError> {
        self.repo.get_work_item(id).await?.ok_or(ThreadError::WorkItemNotFound(*id))
    }

    pub async fn list_work_items(&self, thread_id: &Uuid) -> Result<Vec<WorkItem>, ThreadError> {
        Ok(self.repo.list_work_items(thread_id).await?)
    }

    pub async fn claim_work_item(&self, id: &Uuid) -> Result<WorkItem, ThreadError> {
        self.move_work_item(id, WorkItemStatus::Claimed, None).await
    }

    pub async fn start_work_item(&self, id: &Uuid) -> Result<WorkItem, ThreadError> {
        self.move_work_item(id, WorkItemStatus::Running, None).await
    }

    pub async fn apply_work_item(&self, id: &Uuid) -> Result<WorkItem, ThreadError> {
        self.move_work_item(id, WorkItemStatus::Applied, None).await
    }

    /// Terminal failure; both `code` and `message` must be non-empty.
    pub async fn fail_work_item(&self, id: &Uuid, code: &str, message: &str) -> Result<WorkItem, ThreadError> {
        if code.trim().is_empty() || message.trim().is_empty() {
            return Err(ThreadError::MissingFailureDetail);
        }
        let item = self.move_work_item(id, WorkItemStatus::Failed, Some((code, message))).await?;
        tracing::warn!(work_item_id = %id, code, message, "work item failed");
        Ok(item)
    }

    async fn move_work_item(
        &self,
        id: &Uuid,
        to: WorkItemStatus,
        error: Option<(&str, &str)>,
    ) -> Result<WorkItem, ThreadError> {
        let (code, message) = error.unzip();
        match self.repo.update_work_item_status(id, to, code, message).await {
            Ok(item) => Ok(item),
            Err(RepositoryError::NotFound) => Err(ThreadError::WorkItemNotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Ledger
    // -----------------------------------------------------------------------

    pub async fn record_prompt(
        &self,
        thread_id: &Uuid,
        work_item_id: &Uuid,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        self.append(thread_id, Some(work_item_id), LedgerEntryType::Prompt, payload).await
    }

    pub async fn record_response(
        &self,
        thread_id: &Uuid,
        work_item_id: &Uuid,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        self.append(thread_id, Some(work_item_id), LedgerEntryType::Response, payload).await
    }

    pub async fn record_parse_report(
        &self,
        thread_id: &Uuid,
        work_item_id: &Uuid,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        self.append(thread_id, Some(work_item_id), LedgerEntryType::ParseReport, payload).await
    }

    pub async fn record_mutation(
        &self,
        thread_id: &Uuid,
        work_item_id: &Uuid,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        self.append(thread_id, Some(work_item_id), LedgerEntryType::MutationReport, payload).await
    }

    /// Error entry; `work_item_id` is `None` for thread-level errors.
    pub async fn record_error(
        &self,
        thread_id: &Uuid,
        work_item_id: Option<&Uuid>,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        self.append(thread_id, work_item_id, LedgerEntryType::Error, payload).await
    }

    async fn append(
        &self,
        thread_id: &Uuid,
        work_item_id: Option<&Uuid>,
        entry_type: LedgerEntryType,
        payload: serde_json::Value,
    ) -> Result<(), ThreadError> {
        let entry = LedgerEntry::new(*thread_id, work_item_id.copied(), entry_type, payload);
        tracing::trace!(thread_id = %thread_id, entry_type = %entry_type, "ledger append");
        Ok(self.repo.append_ledger_entry(entry).await?)
    }

    /// Ledger entries in append order, optionally for one work item.
    pub async fn list_ledger(
        &self,
        thread_id: &Uuid,
        work_item_id: Option<&Uuid>,
    ) -> Result<Vec<LedgerEntry>, ThreadError> {
        Ok(self.repo.list_ledger_entries(thread_id, work_item_id).await?)
    }
}
