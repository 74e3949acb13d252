//! Pure in-process knowledge backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::knowledge::backend::KnowledgeBackend;
use crate::knowledge::{Collection, KnowledgeRecord, NewRecord};

#[derive(Default)]
struct Partition {
    last_id: i64,
    records: Vec<KnowledgeRecord>,
}

/// In-memory backend for tests and offline operation. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryBackend {
    partitions: RwLock<HashMap<Collection, Partition>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, collection: Collection) -> Result<(), StorageError> {
        self.partitions.write().await.entry(collection).or_default();
        Ok(())
    }

    async fn insert(&self, collection: Collection, record: NewRecord) -> Result<i64, StorageError> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(collection).or_default();

        partition.last_id += 1;
        let id = partition.last_id;
        let now = Utc::now();
        partition.records.push(KnowledgeRecord {
            id,
            tenant_id: record.tenant_id,
            content: record.content,
            embedding: record.embedding,
            metadata: record.metadata,
            created_at: now,
            updated_at: collection.tracks_updates().then_some(now),
        });
        Ok(id)
    }

    async fn scan(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<Vec<KnowledgeRecord>, StorageError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(&collection)
            .map(|p| {
                p.records
                    .iter()
                    .filter(|r| r.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_by_tenant(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<usize, StorageError> {
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(&collection) else {
            return Ok(0);
        };
        let before = partition.records.len();
        partition.records.retain(|r| r.tenant_id != tenant_id);
        Ok(before - partition.records.len())
    }

    async fn count(
        &self,
        collection: Collection,
        tenant_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(&collection) else {
            return Ok(0);
        };
        Ok(match tenant_id {
            Some(tenant) => partition
                .records
                .iter()
                .filter(|r| r.tenant_id == tenant)
                .count(),
            None => partition.records.len(),
        })
    }
}
