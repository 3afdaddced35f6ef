//! Execution-state repository trait.

use docloom_types::error::RepositoryError;
use docloom_types::execution::ExecutionState;
use docloom_types::thread::SpaceRef;
use uuid::Uuid;

/// Storage interface for execution snapshots (status, current step and the
/// serialized step-progress map).
pub trait ExecutionRepository: Send + Sync {
    /// Upsert a snapshot by id.
    fn save(
        &self,
        state: &ExecutionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionState>, RepositoryError>> + Send;

    fn get_by_thread(
        &self,
        thread_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionState>, RepositoryError>> + Send;

    /// Executions in a scope, newest first.
    fn list_by_scope(
        &self,
        scope: &SpaceRef,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionState>, RepositoryError>> + Send;

    /// Executions not yet in a terminal status.
    fn list_active(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionState>, RepositoryError>> + Send;
}
