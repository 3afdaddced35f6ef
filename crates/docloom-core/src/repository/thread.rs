//! Thread, work item and ledger repository trait.

use docloom_types::error::RepositoryError;
use docloom_types::thread::{
    IdempotencyKey, LedgerEntry, Thread, ThreadStatus, WorkItem, WorkItemStatus,
};
use uuid::Uuid;

/// Storage interface for threads, their work items and the audit ledger.
///
/// Implementations must make `insert_thread_if_absent` and both status
/// updates atomic: they are the only synchronization the thread service
/// relies on when duplicate requests race.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ThreadRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Insert `thread` unless one with the same idempotency key exists.
    ///
    /// Returns the stored thread and `true` if it was inserted by this call.
    fn insert_thread_if_absent(
        &self,
        thread: Thread,
    ) -> impl std::future::Future<Output = Result<(Thread, bool), RepositoryError>> + Send;

    fn get_thread(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Thread>, RepositoryError>> + Send;

    fn get_thread_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> impl std::future::Future<Output = Result<Option<Thread>, RepositoryError>> + Send;

    /// Compare-and-set the thread status.
    ///
    /// Fails with `Conflict` when the current status is not in `expected`.
    /// Terminal targets stamp `closed_at`; non-terminal targets clear it.
    fn update_thread_status(
        &self,
        id: &Uuid,
        expected: &[ThreadStatus],
        to: ThreadStatus,
        failure_reason: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Thread, RepositoryError>> + Send;

    /// Children of a fan-out parent, in creation order.
    fn list_child_threads(
        &self,
        parent_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Thread>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Work items
    // -----------------------------------------------------------------------

    /// Create a work item with `sequence = max(existing) + 1`.
    fn create_work_item(
        &self,
        thread_id: &Uuid,
        lock_scope: &str,
    ) -> impl std::future::Future<Output = Result<WorkItem, RepositoryError>> + Send;

    fn get_work_item(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkItem>, RepositoryError>> + Send;

    /// Move a work item to `to`, rejecting non-monotonic transitions with `Conflict`.
    fn update_work_item_status(
        &self,
        id: &Uuid,
        to: WorkItemStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> impl std::future::Future<Output = Result<WorkItem, RepositoryError>> + Send;

    /// Work items of a thread ordered by sequence.
    fn list_work_items(
        &self,
        thread_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkItem>, RepositoryError>> + Send;

    /// Non-terminal work items (any thread) holding `lock_scope`.
    fn list_open_work_items_by_scope(
        &self,
        lock_scope: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkItem>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Ledger
    // -----------------------------------------------------------------------

    /// Append an entry. Entries are never updated or removed.
    fn append_ledger_entry(
        &self,
        entry: LedgerEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Entries of a thread in append order, optionally narrowed to one work item.
    fn list_ledger_entries(
        &self,
        thread_id: &Uuid,
        work_item_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<LedgerEntry>, RepositoryError>> + Send;
}
