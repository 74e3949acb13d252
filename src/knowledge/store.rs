//! `KnowledgeStore` — embedding cache + backend + ranking.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::knowledge::backend::KnowledgeBackend;
use crate::knowledge::cache::{CacheStats, CachedEmbedder};
use crate::knowledge::similarity;
use crate::knowledge::{Collection, CollectionStats, Metadata, NewRecord, RecordContent, SearchHit};
use crate::llm::EmbeddingProvider;

/// Tenant-partitioned knowledge store.
///
/// The search/store/delete contract is identical for every backend: tenant
/// scoping happens in the backend query, ranking and thresholds happen here.
pub struct KnowledgeStore {
    backend: Arc<dyn KnowledgeBackend>,
    embedder: CachedEmbedder,
}

impl KnowledgeStore {
    pub fn new(
        backend: Arc<dyn KnowledgeBackend>,
        embeddings: Arc<dyn EmbeddingProvider>,
        cache_max_size: usize,
    ) -> Self {
        Self {
            backend,
            embedder: CachedEmbedder::new(embeddings, cache_max_size),
        }
    }

    /// Store a record for `tenant_id`, returning its id.
    ///
    /// The collection follows from the content variant. When `embedding` is
    /// `None` it is computed (or reused from the cache) from the content's
    /// collection-specific text.
    pub async fn store(
        &self,
        tenant_id: &str,
        content: RecordContent,
        metadata: Option<Metadata>,
        embedding: Option<Vec<f32>>,
    ) -> Result<i64, StorageError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(StorageError::Constraint(
                "tenant_id must not be empty".to_string(),
            ));
        }

        let embedding = match embedding {
            Some(embedding) => embedding,
            None => self.embedder.embed(&content.embedding_text()).await?,
        };
        let expected = self.embedder.dimensions();
        if embedding.len() != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }

        let collection = content.collection();
        self.backend.ensure_collection(collection).await?;
        let id = self
            .backend
            .insert(
                collection,
                NewRecord {
                    tenant_id: tenant_id.to_string(),
                    content,
                    embedding,
                    metadata: metadata.unwrap_or_default(),
                },
            )
            .await?;

        debug!(collection = %collection, tenant_id, id, "Stored knowledge record");
        Ok(id)
    }

    /// Similarity search that never fails: any error degrades to an empty list.
    pub async fn search(
        &self,
        collection: Collection,
        tenant_id: &str,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Vec<SearchHit> {
        match self
            .try_search(collection, tenant_id, query, top_k, threshold)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(
                    collection = %collection,
                    tenant_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Knowledge search failed, returning no results"
                );
                Vec::new()
            }
        }
    }

    /// Similarity search that reports failures to the caller.
    ///
    /// Ranks the tenant's records by cosine similarity (descending), drops
    /// anything below `threshold`, and keeps at most `top_k`.
    pub async fn try_search(
        &self,
        collection: Collection,
        tenant_id: &str,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, StorageError> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.backend.ensure_collection(collection).await?;
        let query_embedding = self.embedder.embed(query).await?;
        let records = self.backend.scan(collection, tenant_id.trim()).await?;
        let candidates = records.len();
        let hits = similarity::rank(records, &query_embedding, top_k, threshold);

        debug!(
            collection = %collection,
            tenant_id,
            candidates,
            hits = hits.len(),
            "Knowledge search complete"
        );
        Ok(hits)
    }

    /// Remove all of a tenant's records from a collection.
    pub async fn delete_by_tenant(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<usize, StorageError> {
        self.backend.ensure_collection(collection).await?;
        let removed = self
            .backend
            .delete_by_tenant(collection, tenant_id.trim())
            .await?;
        info!(collection = %collection, tenant_id, removed, "Deleted tenant knowledge");
        Ok(removed)
    }

    /// Total record count, plus the tenant's count when one is given.
    pub async fn get_stats(
        &self,
        collection: Collection,
        tenant_id: Option<&str>,
    ) -> Result<CollectionStats, StorageError> {
        self.backend.ensure_collection(collection).await?;
        let total_records = self.backend.count(collection, None).await?;
        let tenant_records = match tenant_id {
            Some(tenant) => Some(self.backend.count(collection, Some(tenant.trim())).await?),
            None => None,
        };
        Ok(CollectionStats {
            collection,
            total_records,
            tenant_id: tenant_id.map(|t| t.trim().to_string()),
            tenant_records,
        })
    }

    /// Embedding cache hit/miss statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.embedder.cache().stats()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;
    use crate::knowledge::{InMemoryBackend, KnowledgeRecord, LibSqlBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps text onto a few topic axes so similarity is predictable.
    struct TopicEmbedder {
        calls: AtomicUsize,
    }

    const TOPICS: &[&str] = &["quer", "index", "slow", "perform", "python", "deploy"];

    #[async_trait]
    impl EmbeddingProvider for TopicEmbedder {
        fn model_name(&self) -> &str {
            "topics"
        }

        fn dimensions(&self) -> usize {
            TOPICS.len()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    TOPICS
                        .iter()
                        .map(|t| if lower.contains(t) { 1.0 } else { 0.0 })
                        .collect()
                })
                .collect())
        }
    }

    fn topic_embedder() -> Arc<TopicEmbedder> {
        Arc::new(TopicEmbedder {
            calls: AtomicUsize::new(0),
        })
    }

    fn store_with(backend: Arc<dyn KnowledgeBackend>, embedder: Arc<TopicEmbedder>) -> KnowledgeStore {
        KnowledgeStore::new(backend, embedder, 100)
    }

    fn slow_queries() -> RecordContent {
        RecordContent::ProblemSolution {
            problem: "Slow queries".into(),
            solution: "Add an index".into(),
        }
    }

    #[tokio::test]
    async fn stored_problem_is_found_by_related_query() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());
        let id = store.store("t1", slow_queries(), None, None).await.unwrap();

        let hits = store
            .search(Collection::ProblemSolutions, "t1", "query performance", 3, 0.1)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(hits[0].similarity_score > 0.1);
        assert_eq!(hits[0].collection, Collection::ProblemSolutions);
    }

    #[tokio::test]
    async fn search_never_crosses_tenants() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());
        store.store("t1", slow_queries(), None, None).await.unwrap();

        let hits = store
            .search(Collection::ProblemSolutions, "t2", "slow queries", 3, 0.0)
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn threshold_discards_weak_matches() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());
        store.store("t1", slow_queries(), None, None).await.unwrap();

        let hits = store
            .search(Collection::ProblemSolutions, "t1", "python deploy", 3, 0.1)
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_by_tenant_only_touches_that_tenant() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());
        store.store("t1", slow_queries(), None, None).await.unwrap();
        store.store("t1", slow_queries(), None, None).await.unwrap();
        store.store("t2", slow_queries(), None, None).await.unwrap();

        let removed = store
            .delete_by_tenant(Collection::ProblemSolutions, "t1")
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let t1 = store
            .get_stats(Collection::ProblemSolutions, Some("t1"))
            .await
            .unwrap();
        let t2 = store
            .get_stats(Collection::ProblemSolutions, Some("t2"))
            .await
            .unwrap();
        assert_eq!(t1.tenant_records, Some(0));
        assert_eq!(t2.tenant_records, Some(1));
        assert_eq!(t2.total_records, 1);
    }

    #[tokio::test]
    async fn same_text_is_embedded_once() {
        let embedder = topic_embedder();
        let store = store_with(Arc::new(InMemoryBackend::new()), embedder.clone());

        store.store("t1", slow_queries(), None, None).await.unwrap();
        store.store("t2", slow_queries(), None, None).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        let stats = store.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn provided_embedding_skips_the_provider() {
        let embedder = topic_embedder();
        let store = store_with(Arc::new(InMemoryBackend::new()), embedder.clone());

        store
            .store("t1", slow_queries(), None, Some(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_wrong_dimension_and_empty_tenant() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());

        let wrong = store
            .store("t1", slow_queries(), None, Some(vec![1.0]))
            .await;
        assert!(matches!(
            wrong,
            Err(StorageError::DimensionMismatch { expected: 6, actual: 1 })
        ));

        let empty = store.store("  ", slow_queries(), None, None).await;
        assert!(matches!(empty, Err(StorageError::Constraint(_))));
    }

    #[tokio::test]
    async fn libsql_backend_honours_the_same_contract() {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store = store_with(backend, topic_embedder());
        let id = store.store("t1", slow_queries(), None, None).await.unwrap();
        store.store("t2", slow_queries(), None, None).await.unwrap();

        let hits = store
            .search(Collection::ProblemSolutions, "t1", "query performance", 3, 0.1)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert_eq!(hits[0].tenant_id, "t1");

        store
            .delete_by_tenant(Collection::ProblemSolutions, "t1")
            .await
            .unwrap();
        let stats = store
            .get_stats(Collection::ProblemSolutions, Some("t1"))
            .await
            .unwrap();
        assert_eq!(stats.tenant_records, Some(0));
        assert_eq!(stats.total_records, 1);
    }

    struct BrokenBackend;

    #[async_trait]
    impl KnowledgeBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        async fn ensure_collection(&self, _collection: Collection) -> Result<(), StorageError> {
            Ok(())
        }

        async fn insert(
            &self,
            _collection: Collection,
            _record: NewRecord,
        ) -> Result<i64, StorageError> {
            Err(StorageError::Connection("down".into()))
        }

        async fn scan(
            &self,
            _collection: Collection,
            _tenant_id: &str,
        ) -> Result<Vec<KnowledgeRecord>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }

        async fn delete_by_tenant(
            &self,
            _collection: Collection,
            _tenant_id: &str,
        ) -> Result<usize, StorageError> {
            Err(StorageError::Connection("down".into()))
        }

        async fn count(
            &self,
            _collection: Collection,
            _tenant_id: Option<&str>,
        ) -> Result<usize, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
    }

    #[tokio::test]
    async fn backend_failure_degrades_search_to_empty() {
        let store = store_with(Arc::new(BrokenBackend), topic_embedder());
        let hits = store
            .search(Collection::ProblemSolutions, "t1", "slow queries", 3, 0.0)
            .await;
        assert!(hits.is_empty());
        assert!(
            store
                .try_search(Collection::ProblemSolutions, "t1", "slow queries", 3, 0.0)
                .await
                .is_err()
        );
        assert!(store.store("t1", slow_queries(), None, None).await.is_err());
    }

    #[tokio::test]
    async fn search_lazily_creates_missing_collection() {
        let store = store_with(Arc::new(InMemoryBackend::new()), topic_embedder());
        let hits = store
            .search(Collection::ExpertKnowledge, "t1", "python", 3, 0.0)
            .await;
        assert!(hits.is_empty());
        let stats = store.get_stats(Collection::ExpertKnowledge, None).await.unwrap();
        assert_eq!(stats.total_records, 0);
    }
}
