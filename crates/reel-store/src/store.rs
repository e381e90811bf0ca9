//! The abstract document-store backend.

use async_trait::async_trait;

use crate::StoreError;
use crate::types::{ChangeFeed, Document, FieldUpdate, Fields, Filter, Query, WatchOptions, WriteOp};

/// Read-modify-write closure for [`DocumentStore::transact`].
///
/// Receives the current fields (or `None` when the document does not exist)
/// and returns the fields to write. May be invoked more than once under contention.
pub type TransactFn<'a> = &'a (dyn Fn(Option<&Fields>) -> Fields + Send + Sync);

/// A document database reachable through a query/read/write/subscribe API.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a single document. Absent documents are `Ok(None)`.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Read several documents in one round-trip. Missing ids are omitted.
    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Count the documents matching every filter.
    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Create a document with a backend-assigned id.
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError>;

    /// Create or overwrite a document.
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<Document, StoreError>;

    /// Apply field updates to an existing document. Fails with `NotFound` when absent.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> Result<Document, StoreError>;

    /// Delete a document. Fails with `NotFound` when absent.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Transactional read-modify-write of a single document.
    async fn transact(
        &self,
        collection: &str,
        id: &str,
        apply: TransactFn<'_>,
    ) -> Result<Fields, StoreError>;

    /// Apply several writes atomically. Either every op lands or none does.
    async fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Subscribe to changes on a collection.
    async fn watch(&self, collection: &str, options: WatchOptions) -> Result<ChangeFeed, StoreError>;
}
