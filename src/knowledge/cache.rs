//! Bounded LRU embedding cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::EmbeddingError;
use crate::llm::EmbeddingProvider;

/// SHA-256 of `(model, text)`.
pub type CacheKey = [u8; 32];

/// Build the cache key for a text under a given embedding model.
pub fn cache_key(text: &str, model: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_ratio: f64,
}

struct Slot {
    vector: Vec<f32>,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    slots: HashMap<CacheKey, Slot>,
    /// Access tick -> key; the first entry is the least recently used.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

/// Embedding cache keyed by content hash, evicting the least recently used
/// entry once `max_size` is exceeded.
pub struct EmbeddingCache {
    state: Mutex<LruState>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an embedding, marking it most recently used on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        let mut guard = self.lock();
        let LruState {
            slots,
            recency,
            tick,
        } = &mut *guard;

        match slots.get_mut(key) {
            Some(slot) => {
                *tick += 1;
                recency.remove(&slot.tick);
                slot.tick = *tick;
                recency.insert(*tick, *key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.vector.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or refresh an embedding, evicting LRU entries over capacity.
    pub fn insert(&self, key: CacheKey, vector: Vec<f32>) {
        let mut guard = self.lock();
        let LruState {
            slots,
            recency,
            tick,
        } = &mut *guard;

        *tick += 1;
        if let Some(previous) = slots.insert(
            key,
            Slot {
                vector,
                tick: *tick,
            },
        ) {
            recency.remove(&previous.tick);
        }
        recency.insert(*tick, key);

        while slots.len() > self.max_size {
            let Some((_, evicted)) = recency.pop_first() else {
                break;
            };
            slots.remove(&evicted);
            debug!(size = slots.len(), "Evicted least recently used embedding");
        }
    }

    /// Whether a key is cached, without touching recency or counters.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.slots.clear();
        state.recency.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.len(),
            max_size: self.max_size,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("max_size", &self.max_size)
            .field("current_size", &self.len())
            .finish()
    }
}

/// An embedding provider fronted by an [`EmbeddingCache`].
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl CachedEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, max_size: usize) -> Self {
        Self {
            provider,
            cache: EmbeddingCache::new(max_size),
        }
    }

    /// Embed one text. A hit skips the provider; a miss makes exactly one call.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = cache_key(text, self.provider.model_name());
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }

        let mut vectors = self.provider.embed(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
            });
        }
        let vector = vectors.remove(0);
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}
