//! Multi-query retrieval.
//!
//! Several differently phrased queries are issued against the same scope
//! (a policy or a document), the results are merged, deduplicated by chunk
//! text, ranked by distance and truncated. Queries run concurrently with a
//! bounded number in flight and a per-query timeout; a failed or timed-out
//! query is reported in [`RetrievalOutcome::failures`] and left out of the
//! merge instead of failing the whole retrieval.

use crate::cache::CachedEmbedder;
use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::vector_index::{IndexFilter, RetrievedChunk, VectorIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// A topic query that did not contribute to the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    pub query: String,
    pub error: String,
}

/// Merged retrieval result plus any per-query failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub failures: Vec<QueryFailure>,
    pub queries_succeeded: usize,
    pub duration_ms: u64,
}

impl RetrievalOutcome {
    /// True when some queries failed but the rest still produced the result.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Results requested per query so that `query_count` queries together can
/// fill `total_desired` slots.
pub fn k_per_query(total_desired: usize, query_count: usize) -> usize {
    if query_count == 0 {
        return 0;
    }
    total_desired.div_ceil(query_count)
}

/// Key used to decide whether two chunks are the same piece of evidence.
fn dedup_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Merge per-query result lists: drop repeated texts (first seen wins),
/// sort ascending by distance, keep `total_desired`.
pub fn merge_results(
    per_query: Vec<Vec<RetrievedChunk>>,
    total_desired: usize,
) -> Vec<RetrievedChunk> {
    let mut seen = HashSet::new();
    let mut merged: Vec<RetrievedChunk> = per_query
        .into_iter()
        .flatten()
        .filter(|hit| seen.insert(dedup_key(&hit.chunk.text)))
        .collect();
    // Stable sort keeps first-seen order among equal distances.
    merged.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    merged.truncate(total_desired);
    merged
}

/// Fans topic queries out over a vector index and merges the evidence.
pub struct MultiQueryRetriever {
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<CachedEmbedder>,
    /// Shared by every retrieval, so concurrent callers together stay
    /// within `max_concurrent_queries`.
    permits: Arc<Semaphore>,
    query_timeout: Duration,
}

impl MultiQueryRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<CachedEmbedder>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            permits: Arc::new(Semaphore::new(config.max_concurrent_queries.max(1))),
            query_timeout: Duration::from_secs(config.query_timeout_secs.max(1)),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embeddings(&self) -> &Arc<CachedEmbedder> {
        &self.embeddings
    }

    /// Embed one query and search the index.
    pub async fn query_once(
        &self,
        query: &str,
        k: usize,
        scope: &IndexFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let vector = self
            .embeddings
            .get_or_embed(query)
            .await
            .map_err(|e| e.in_scope("embed_query", &scope.scope_label()))?;
        self.index.query(&vector, k, scope).await
    }

    /// Run every query in `queries` against `scope` and merge the results.
    ///
    /// Fails only when `queries` is empty or when every query failed; an
    /// empty merge with at least one successful query is a normal result.
    pub async fn retrieve(
        &self,
        scope: &IndexFilter,
        queries: &[String],
        total_desired: usize,
    ) -> Result<RetrievalOutcome> {
        if queries.is_empty() {
            return Err(RagError::validation("retrieval needs at least one query"));
        }
        let start = Instant::now();
        let k = k_per_query(total_desired, queries.len());
        let timeout_secs = self.query_timeout.as_secs();

        let tasks = queries.iter().map(|query| async move {
            // The semaphore is never closed, so acquire cannot fail.
            let _permit = self.permits.acquire().await.ok();
            match tokio::time::timeout(self.query_timeout, self.query_once(query, k, scope)).await {
                Ok(result) => result,
                Err(_) => Err(RagError::Timeout {
                    operation: "topic_query".into(),
                    timeout_secs,
                }),
            }
        });

        // join_all yields results in input order, so the merge is
        // deterministic no matter which query finishes first.
        let results = futures::future::join_all(tasks).await;

        let mut per_query = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(hits) => per_query.push(hits),
                Err(e) => {
                    warn!(
                        scope = %scope.scope_label(),
                        query = query.as_str(),
                        error = %e,
                        "Topic query failed; excluding it from the merge"
                    );
                    failures.push(QueryFailure {
                        query: query.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if per_query.is_empty() {
            let detail = failures
                .iter()
                .map(|f| f.error.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RagError::upstream(
                "multi_query_retrieve",
                scope.scope_label(),
                format!("all {} queries failed: {detail}", queries.len()),
            ));
        }

        let queries_succeeded = per_query.len();
        let chunks = merge_results(per_query, total_desired);
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            scope = %scope.scope_label(),
            queries = queries.len(),
            failed = failures.len(),
            k_per_query = k,
            returned = chunks.len(),
            duration_ms,
            "Multi-query retrieval complete"
        );

        Ok(RetrievalOutcome {
            chunks,
            failures,
            queries_succeeded,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruEmbeddingCache;
    use crate::chunker::Chunk;
    use crate::embeddings::LocalEmbedder;
    use crate::vector_index::{ChunkMetadata, InMemoryVectorIndex, IndexRecord};
    use async_trait::async_trait;

    fn hit(id: &str, text: &str, distance: f32) -> RetrievedChunk {
        RetrievedChunk {
            id: id.to_string(),
            chunk: Chunk {
                text: text.to_string(),
                chunk_index: 0,
                page_number: Some(1),
                document_id: Some("doc".into()),
                policy_id: Some("pol".into()),
            },
            distance,
        }
    }

    #[test]
    fn test_k_per_query_rounds_up() {
        assert_eq!(k_per_query(10, 6), 2);
        assert_eq!(k_per_query(12, 6), 2);
        assert_eq!(k_per_query(13, 6), 3);
        assert_eq!(k_per_query(1, 5), 1);
        assert_eq!(k_per_query(10, 0), 0);
    }

    #[test]
    fn test_merge_dedups_by_text_not_id() {
        let merged = merge_results(
            vec![
                vec![hit("doc_chunk_1", "Accidents are covered.", 0.2)],
                vec![hit("other_chunk_9", "  accidents are COVERED. ", 0.1)],
            ],
            10,
        );
        assert_eq!(merged.len(), 1);
        // First seen wins, even though the duplicate was closer.
        assert_eq!(merged[0].id, "doc_chunk_1");
    }

    #[test]
    fn test_merge_sorts_and_truncates() {
        let merged = merge_results(
            vec![
                vec![hit("a", "alpha", 0.5), hit("b", "beta", 0.3)],
                vec![hit("c", "gamma", 0.1), hit("d", "delta", 0.9)],
            ],
            3,
        );
        let ids: Vec<&str> = merged.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_results(vec![vec![], vec![]], 5).is_empty());
    }

    /// Index that fails every query whose vector matches a poisoned query.
    struct PoisonedIndex {
        inner: InMemoryVectorIndex,
        poisoned: Vec<f32>,
        hang: bool,
    }

    #[async_trait]
    impl VectorIndex for PoisonedIndex {
        async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
            self.inner.upsert(records).await
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: &IndexFilter,
        ) -> Result<Vec<RetrievedChunk>> {
            if vector == self.poisoned.as_slice() {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                return Err(RagError::upstream("vector_query", "test", "shard offline"));
            }
            self.inner.query(vector, k, filter).await
        }

        async fn delete_by(&self, filter: &IndexFilter) -> Result<usize> {
            self.inner.delete_by(filter).await
        }

        async fn count(&self, filter: &IndexFilter) -> Result<usize> {
            self.inner.count(filter).await
        }

        fn backend_name(&self) -> &str {
            "poisoned"
        }
    }

    async fn seeded_retriever(poison: &str, hang: bool, timeout_secs: u64) -> MultiQueryRetriever {
        let embedder = LocalEmbedder::new(64);
        let texts = [
            "The annual deductible is $250 per policy year.",
            "Reimbursement rate is 90% of eligible costs.",
            "Hip dysplasia is excluded during the first year.",
            "Accidents have a 2 day waiting period.",
        ];
        let index = PoisonedIndex {
            inner: InMemoryVectorIndex::new("test"),
            poisoned: embedder.embed_sync(poison),
            hang,
        };
        let records = texts
            .iter()
            .enumerate()
            .map(|(i, text)| IndexRecord {
                id: format!("doc_chunk_{i}"),
                vector: embedder.embed_sync(text),
                document: text.to_string(),
                metadata: ChunkMetadata {
                    document_id: "doc".into(),
                    policy_id: Some("pol".into()),
                    chunk_index: i,
                    page_number: Some(1),
                },
            })
            .collect();
        index.upsert(records).await.unwrap();

        let cached = Arc::new(CachedEmbedder::new(
            Arc::new(embedder),
            Arc::new(LruEmbeddingCache::new(Some(64))),
        ));
        let config = RetrievalConfig {
            default_k: 10,
            max_concurrent_queries: 2,
            query_timeout_secs: timeout_secs,
        };
        MultiQueryRetriever::new(Arc::new(index), cached, &config)
    }

    fn queries(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_retrieve_merges_and_ranks() {
        let retriever = seeded_retriever("never asked", false, 5).await;
        let outcome = retriever
            .retrieve(
                &IndexFilter::for_policy("pol"),
                &queries(&["annual deductible", "reimbursement rate", "waiting period"]),
                4,
            )
            .await
            .unwrap();

        assert!(!outcome.is_partial());
        assert_eq!(outcome.queries_succeeded, 3);
        assert!(!outcome.chunks.is_empty());
        assert!(outcome.chunks.len() <= 4);
        let mut texts = HashSet::new();
        for chunk in &outcome.chunks {
            assert!(texts.insert(chunk.chunk.text.clone()), "duplicate chunk text");
        }
        for pair in outcome.chunks.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[tokio::test]
    async fn test_failed_query_is_excluded() {
        let retriever = seeded_retriever("excluded conditions", false, 5).await;
        let outcome = retriever
            .retrieve(
                &IndexFilter::for_policy("pol"),
                &queries(&["annual deductible", "excluded conditions", "waiting period"]),
                6,
            )
            .await
            .unwrap();

        assert_eq!(outcome.queries_succeeded, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].query, "excluded conditions");
        assert!(!outcome.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_query_is_a_partial_failure() {
        let retriever = seeded_retriever("slow shard", true, 1).await;
        let outcome = retriever
            .retrieve(
                &IndexFilter::for_policy("pol"),
                &queries(&["slow shard", "annual deductible"]),
                4,
            )
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].error.contains("timed out"));
        assert!(!outcome.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_all_queries_failing_is_an_error() {
        let retriever = seeded_retriever("only query", false, 5).await;
        let err = retriever
            .retrieve(&IndexFilter::for_policy("pol"), &queries(&["only query"]), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_empty_scope_returns_empty_not_error() {
        let retriever = seeded_retriever("never asked", false, 5).await;
        let outcome = retriever
            .retrieve(
                &IndexFilter::for_policy("unknown-policy"),
                &queries(&["annual deductible", "waiting period"]),
                4,
            )
            .await
            .unwrap();
        assert!(outcome.chunks.is_empty());
        assert!(outcome.failures.is_empty());
    }

    /// Counts queries in flight and remembers the peak.
    struct SlowIndex {
        inner: InMemoryVectorIndex,
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for SlowIndex {
        async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
            self.inner.upsert(records).await
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: &IndexFilter,
        ) -> Result<Vec<RetrievedChunk>> {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.query(vector, k, filter).await
        }

        async fn delete_by(&self, filter: &IndexFilter) -> Result<usize> {
            self.inner.delete_by(filter).await
        }

        async fn count(&self, filter: &IndexFilter) -> Result<usize> {
            self.inner.count(filter).await
        }

        fn backend_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_concurrent_retrievals_share_the_query_limit() {
        let index = Arc::new(SlowIndex {
            inner: InMemoryVectorIndex::new("test"),
            in_flight: Default::default(),
            peak: Default::default(),
        });
        let cached = Arc::new(CachedEmbedder::new(
            Arc::new(LocalEmbedder::new(32)),
            Arc::new(LruEmbeddingCache::new(None)),
        ));
        let config = RetrievalConfig {
            default_k: 10,
            max_concurrent_queries: 2,
            query_timeout_secs: 5,
        };
        let retriever = MultiQueryRetriever::new(index.clone(), cached, &config);

        let scope_a = IndexFilter::for_policy("a");
        let scope_b = IndexFilter::for_policy("b");
        let topics = queries(&["deductible", "exclusions", "waiting period"]);
        let (a, b) = tokio::join!(
            retriever.retrieve(&scope_a, &topics, 6),
            retriever.retrieve(&scope_b, &topics, 6),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(index.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_names_the_query_scope() {
        struct DownEmbedder;

        #[async_trait]
        impl crate::embeddings::Embedder for DownEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Err(RagError::upstream("embed", "api.example.com", "HTTP 503"))
            }

            fn dimensions(&self) -> usize {
                8
            }

            fn provider_name(&self) -> &str {
                "down"
            }
        }

        let cached = Arc::new(CachedEmbedder::new(
            Arc::new(DownEmbedder),
            Arc::new(LruEmbeddingCache::new(None)),
        ));
        let retriever = MultiQueryRetriever::new(
            Arc::new(InMemoryVectorIndex::new("test")),
            cached,
            &RetrievalConfig::default(),
        );
        let err = retriever
            .query_once("deductible", 3, &IndexFilter::for_policy("pol-7"))
            .await
            .unwrap_err();
        match err {
            RagError::Upstream {
                operation,
                scope,
                message,
            } => {
                assert_eq!(operation, "embed_query");
                assert_eq!(scope, "policy:pol-7");
                assert_eq!(message, "embed: HTTP 503");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_queries_rejected() {
        let retriever = seeded_retriever("never asked", false, 5).await;
        assert!(matches!(
            retriever.retrieve(&IndexFilter::for_policy("pol"), &[], 4).await,
            Err(RagError::Validation { .. })
        ));
    }
}
