//! Storage contract shared by every knowledge backend.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::knowledge::{Collection, KnowledgeRecord, NewRecord};

/// Backend-agnostic record storage.
///
/// Backends only persist and filter by tenant; similarity ranking, threshold
/// filtering and `top_k` live in `KnowledgeStore` so every backend answers a
/// search identically.
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Create the collection if it does not exist yet. Idempotent.
    async fn ensure_collection(&self, collection: Collection) -> Result<(), StorageError>;

    /// Append a record, returning its id (monotonically increasing per collection).
    async fn insert(&self, collection: Collection, record: NewRecord) -> Result<i64, StorageError>;

    /// All records for one tenant in a collection, oldest first.
    async fn scan(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<Vec<KnowledgeRecord>, StorageError>;

    /// Remove every record for one tenant. Returns the number removed.
    async fn delete_by_tenant(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<usize, StorageError>;

    /// Record count for the whole collection, or for one tenant.
    async fn count(
        &self,
        collection: Collection,
        tenant_id: Option<&str>,
    ) -> Result<usize, StorageError>;
}
