//! In-process repository adapters.
//!
//! Each store keeps its state behind a single `tokio::sync::RwLock`, so every
//! trait method is one atomic step. That is what makes get-or-create and the
//! compare-and-set status updates race-free for concurrent callers.

use std::collections::HashMap;

use chrono::Utc;
use docloom_types::document::Document;
use docloom_types::error::RepositoryError;
use docloom_types::execution::ExecutionState;
use docloom_types::thread::{
    IdempotencyKey, LedgerEntry, SpaceRef, Thread, ThreadStatus, WorkItem, WorkItemStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::document::DocumentRepository;
use super::execution::ExecutionRepository;
use super::thread::ThreadRepository;

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ThreadTables {
    threads: HashMap<Uuid, Thread>,
    /// Insertion order of threads, for stable child listings.
    thread_order: Vec<Uuid>,
    by_key: HashMap<IdempotencyKey, Uuid>,
    work_items: HashMap<Uuid, WorkItem>,
    items_by_thread: HashMap<Uuid, Vec<Uuid>>,
    ledger: Vec<LedgerEntry>,
}

/// In-memory [`ThreadRepository`].
#[derive(Default)]
pub struct InMemoryThreadRepository {
    tables: RwLock<ThreadTables>,
}

impl InMemoryThreadRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadRepository for InMemoryThreadRepository {
    async fn insert_thread_if_absent(&self, thread: Thread) -> Result<(Thread, bool), RepositoryError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .by_key
            .get(&thread.idempotency_key)
            .and_then(|id| tables.threads.get(id))
        {
            return Ok((existing.clone(), false));
        }
        tables.by_key.insert(thread.idempotency_key.clone(), thread.id);
        tables.thread_order.push(thread.id);
        tables.threads.insert(thread.id, thread.clone());
        Ok((thread, true))
    }

    async fn get_thread(&self, id: &Uuid) -> Result<Option<Thread>, RepositoryError> {
        Ok(self.tables.read().await.threads.get(id).cloned())
    }

    async fn get_thread_by_key(&self, key: &IdempotencyKey) -> Result<Option<Thread>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.by_key.get(key).and_then(|id| tables.threads.get(id)).cloned())
    }

    async fn update_thread_status(
        &self,
        id: &Uuid,
        expected: &[ThreadStatus],
        to: ThreadStatus,
        failure_reason: Option<&str>,
    ) -> Result<Thread, RepositoryError> {
        let mut tables = self.tables.write().await;
        let thread = tables.threads.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !expected.contains(&thread.status) {
            return Err(RepositoryError::Conflict(format!(
                "thread {id} is {}, cannot move to {to}",
                thread.status
            )));
        }
        thread.status = to;
        thread.closed_at = to.is_terminal().then(Utc::now);
        thread.failure_reason = match to {
            ThreadStatus::Failed => failure_reason.map(str::to_string),
            _ => None,
        };
        Ok(thread.clone())
    }

    async fn list_child_threads(&self, parent_id: &Uuid) -> Result<Vec<Thread>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .thread_order
            .iter()
            .filter_map(|id| tables.threads.get(id))
            .filter(|t| t.parent_thread_id.as_ref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn create_work_item(&self, thread_id: &Uuid, lock_scope: &str) -> Result<WorkItem, RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.threads.contains_key(thread_id) {
            return Err(RepositoryError::NotFound);
        }
        let sequence = tables
            .items_by_thread
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.work_items.get(id))
            .map(|wi| wi.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let item = WorkItem {
            id: Uuid::now_v7(),
            thread_id: *thread_id,
            sequence,
            lock_scope: lock_scope.to_string(),
            status: WorkItemStatus::Created,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tables.items_by_thread.entry(*thread_id).or_default().push(item.id);
        tables.work_items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_work_item(&self, id: &Uuid) -> Result<Option<WorkItem>, RepositoryError> {
        Ok(self.tables.read().await.work_items.get(id).cloned())
    }

    async fn update_work_item_status(
        &self,
        id: &Uuid,
        to: WorkItemStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<WorkItem, RepositoryError> {
        let mut tables = self.tables.write().await;
        let item = tables.work_items.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !to.allowed_from().contains(&item.status) {
            return Err(RepositoryError::Conflict(format!(
                "work item {id} is {}, cannot move to {to}",
                item.status
            )));
        }
        item.status = to;
        item.updated_at = Utc::now();
        if let Some(code) = error_code {
            item.error_code = Some(code.to_string());
        }
        if let Some(message) = error_message {
            item.error_message = Some(message.to_string());
        }
        Ok(item.clone())
    }

    async fn list_work_items(&self, thread_id: &Uuid) -> Result<Vec<WorkItem>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut items: Vec<WorkItem> = tables
            .items_by_thread
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.work_items.get(id))
            .cloned()
            .collect();
        items.sort_by_key(|wi| wi.sequence);
        Ok(items)
    }

    async fn list_open_work_items_by_scope(&self, lock_scope: &str) -> Result<Vec<WorkItem>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .work_items
            .values()
            .filter(|wi| wi.lock_scope == lock_scope && !wi.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn append_ledger_entry(&self, entry: LedgerEntry) -> Result<(), RepositoryError> {
        self.tables.write().await.ledger.push(entry);
        Ok(())
    }

    async fn list_ledger_entries(
        &self,
        thread_id: &Uuid,
        work_item_id: Option<&Uuid>,
    ) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|e| &e.thread_id == thread_id)
            .filter(|e| work_item_id.is_none_or(|wi| e.work_item_id.as_ref() == Some(wi)))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// In-memory [`DocumentRepository`]. Versions are kept in save order.
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: RwLock<Vec<Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign version and latest flag, clearing the previous latest version.
    fn insert_version(documents: &mut Vec<Document>, mut document: Document) -> Document {
        let mut next_version = 1;
        for existing in documents
            .iter_mut()
            .filter(|d| d.scope == document.scope && d.doc_type == document.doc_type)
        {
            next_version = next_version.max(existing.version + 1);
            existing.is_latest = false;
        }
        document.version = next_version;
        document.is_latest = true;
        documents.push(document.clone());
        document
    }
}

impl DocumentRepository for InMemoryDocumentRepository {
    async fn save(&self, document: Document) -> Result<Document, RepositoryError> {
        let mut documents = self.documents.write().await;
        Ok(Self::insert_version(&mut documents, document))
    }

    async fn save_batch(&self, batch: Vec<Document>) -> Result<Vec<Document>, RepositoryError> {
        let mut documents = self.documents.write().await;
        Ok(batch
            .into_iter()
            .map(|d| Self::insert_version(&mut documents, d))
            .collect())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Document>, RepositoryError> {
        Ok(self.documents.read().await.iter().find(|d| &d.id == id).cloned())
    }

    async fn get_by_scope_type(
        &self,
        scope: &SpaceRef,
        doc_type: &str,
        version: Option<u32>,
    ) -> Result<Option<Document>, RepositoryError> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|d| &d.scope == scope && d.doc_type == doc_type)
            .find(|d| match version {
                Some(v) => d.version == v,
                None => d.is_latest,
            })
            .cloned())
    }

    async fn list_by_scope(&self, scope: &SpaceRef) -> Result<Vec<Document>, RepositoryError> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|d| &d.scope == scope && d.is_latest)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut documents = self.documents.write().await;
        let Some(pos) = documents.iter().position(|d| &d.id == id) else {
            return Ok(false);
        };
        let removed = documents.remove(pos);
        // Promote the highest remaining version when the latest one goes away.
        if removed.is_latest
            && let Some(previous) = documents
                .iter_mut()
                .filter(|d| d.scope == removed.scope && d.doc_type == removed.doc_type)
                .max_by_key(|d| d.version)
        {
            previous.is_latest = true;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// In-memory [`ExecutionRepository`].
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<Uuid, ExecutionState>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, state: &ExecutionState) -> Result<(), RepositoryError> {
        self.executions.write().await.insert(state.id, state.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn get_by_thread(&self, thread_id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .find(|e| &e.thread_id == thread_id)
            .cloned())
    }

    async fn list_by_scope(&self, scope: &SpaceRef) -> Result<Vec<ExecutionState>, RepositoryError> {
        let mut list: Vec<ExecutionState> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| &e.scope == scope)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn list_active(&self) -> Result<Vec<ExecutionState>, RepositoryError> {
        let mut list: Vec<ExecutionState> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}
