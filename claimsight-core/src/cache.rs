//! Query-embedding cache.
//!
//! Query text is normalized (lowercased, trimmed, whitespace runs collapsed)
//! before lookup, so trivially different phrasings of the same question
//! share one entry and one embedding call. The cache is an injectable
//! trait object owned by whoever builds the pipeline; `LruEmbeddingCache`
//! is the bounded default.

use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

/// Normalize query text into a cache key.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Aggregate cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

impl CacheStats {
    /// Compute the hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Storage for normalized-query embeddings.
pub trait EmbeddingCache: Send + Sync {
    /// Look up a key, counting a hit or a miss.
    fn lookup(&self, key: &str) -> Option<Arc<[f32]>>;

    /// Look up a key without touching the counters.
    fn peek(&self, key: &str) -> Option<Arc<[f32]>>;

    fn store(&self, key: String, vector: Arc<[f32]>);

    fn stats(&self) -> CacheStats;

    /// Drop every entry and reset the counters.
    fn clear(&self);

    fn size(&self) -> usize {
        self.stats().size
    }
}

/// LRU-bounded embedding cache.
pub struct LruEmbeddingCache {
    entries: Mutex<LruCache<String, Arc<[f32]>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruEmbeddingCache {
    /// Create a cache holding at most `capacity` entries, or an unbounded
    /// one when `capacity` is `None` or zero.
    pub fn new(capacity: Option<usize>) -> Self {
        let entries = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<[f32]>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EmbeddingCache for LruEmbeddingCache {
    fn lookup(&self, key: &str) -> Option<Arc<[f32]>> {
        let found = self.entries().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn peek(&self, key: &str) -> Option<Arc<[f32]>> {
        self.entries().peek(key).cloned()
    }

    fn store(&self, key: String, vector: Arc<[f32]>) {
        self.entries().put(key, vector);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries().len(),
        }
    }

    fn clear(&self) {
        self.entries().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

type InFlight = Arc<OnceCell<Arc<[f32]>>>;

/// Embedding client fronted by an [`EmbeddingCache`].
///
/// Concurrent misses on the same normalized key wait on a single embedding
/// call instead of each issuing their own.
pub struct CachedEmbedder {
    embedder: Arc<dyn Embedder>,
    cache: Arc<dyn EmbeddingCache>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl CachedEmbedder {
    pub fn new(embedder: Arc<dyn Embedder>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self {
            embedder,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn cache(&self) -> &Arc<dyn EmbeddingCache> {
        &self.cache
    }

    /// Return the embedding for `text`, calling the embedding service only
    /// on a cache miss.
    pub async fn get_or_embed(&self, text: &str) -> Result<Arc<[f32]>> {
        let key = normalize_query(text);
        if key.is_empty() {
            return Err(RagError::validation("query text is empty"));
        }

        if let Some(vector) = self.cache.lookup(&key) {
            debug!(key = key.as_str(), "Embedding cache hit");
            return Ok(vector);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // Another task may have finished between the lookup and here.
            if let Some(vector) = self.cache.peek(&key) {
                return Ok(vector);
            }
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                debug!(key = key.as_str(), "Embedding cache miss");
                self.embedder.embed(&key).await.map(Arc::<[f32]>::from)
            })
            .await
            .cloned();

        if let Ok(vector) = &result {
            self.cache.store(key.clone(), vector.clone());
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(&key);
        }

        result
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn size(&self) -> usize {
        self.cache.size()
    }
}
