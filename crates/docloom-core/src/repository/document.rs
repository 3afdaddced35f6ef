//! Versioned document repository trait.

use docloom_types::document::Document;
use docloom_types::error::RepositoryError;
use docloom_types::thread::SpaceRef;
use uuid::Uuid;

/// Storage interface for generated documents.
///
/// The store keeps exactly one `is_latest` version per `(scope, doc_type)`.
/// Saving assigns the next version number and clears the previous latest
/// flag in the same logical operation.
pub trait DocumentRepository: Send + Sync {
    /// Save a new version; returns the stored document with version and latest flag set.
    fn save(
        &self,
        document: Document,
    ) -> impl std::future::Future<Output = Result<Document, RepositoryError>> + Send;

    /// Save many documents as one logical write.
    fn save_batch(
        &self,
        documents: Vec<Document>,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Document>, RepositoryError>> + Send;

    /// A specific version, or the latest when `version` is `None`.
    fn get_by_scope_type(
        &self,
        scope: &SpaceRef,
        doc_type: &str,
        version: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Option<Document>, RepositoryError>> + Send;

    /// Latest version of every document type in a scope.
    fn list_by_scope(
        &self,
        scope: &SpaceRef,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, RepositoryError>> + Send;

    /// Delete one version. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
