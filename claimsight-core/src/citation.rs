//! Citation matching for extracted fields.
//!
//! Every field that carries a value gets one retrieval with that field's
//! topic phrase. Chunks closer than the distance threshold become
//! citations; when nothing is close enough the single best chunk is kept so
//! a present value is never left without any pointer into the source.

use crate::config::CitationConfig;
use crate::extraction::{Citation, ExtractionField, ExtractionResult};
use crate::retriever::MultiQueryRetriever;
use crate::vector_index::{IndexFilter, RetrievedChunk};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A field whose citation lookup failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationFailure {
    pub field: ExtractionField,
    pub error: String,
}

/// An extraction with citations attached, plus fields that could not be
/// cited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationOutcome {
    pub extraction: ExtractionResult,
    pub failures: Vec<CitationFailure>,
}

/// Pick citations from `chunks` (assumed sorted ascending by distance).
pub fn select_citations(chunks: &[RetrievedChunk], threshold: f32, max: usize) -> Vec<Citation> {
    let close: Vec<&RetrievedChunk> = chunks
        .iter()
        .filter(|hit| hit.distance < threshold)
        .take(max)
        .collect();
    let picked = if close.is_empty() {
        chunks.iter().take(1).collect()
    } else {
        close
    };
    picked
        .into_iter()
        .map(|hit| Citation {
            page_number: hit.chunk.page_number,
            chunk_id: Some(hit.id.clone()),
        })
        .collect()
}

pub struct CitationMatcher {
    retriever: Arc<MultiQueryRetriever>,
    threshold: f32,
    max_per_field: usize,
    candidates: usize,
}

impl CitationMatcher {
    pub fn new(retriever: Arc<MultiQueryRetriever>, config: &CitationConfig) -> Self {
        Self {
            retriever,
            threshold: config.distance_threshold,
            max_per_field: config.max_per_field.max(1),
            candidates: config.candidates_per_field.max(1),
        }
    }

    /// Attach citations to every present field of `extraction`.
    ///
    /// Lookups run concurrently; a failed lookup leaves its field uncited
    /// and is reported in [`CitationOutcome::failures`].
    pub async fn attach_citations(
        &self,
        mut extraction: ExtractionResult,
        scope: &IndexFilter,
    ) -> CitationOutcome {
        let fields = extraction.fields.present_fields();
        let lookups = fields.iter().map(|field| self.cite_field(*field, scope));
        let results = futures::future::join_all(lookups).await;

        let mut failures = Vec::new();
        for (field, result) in fields.into_iter().zip(results) {
            match result {
                Ok(citations) if citations.is_empty() => {
                    debug!(field = field.key(), "No evidence found for field");
                }
                Ok(citations) => {
                    extraction.citations.insert(field, citations);
                }
                Err(e) => {
                    warn!(
                        field = field.key(),
                        scope = %scope.scope_label(),
                        error = %e,
                        "Citation lookup failed; leaving field uncited"
                    );
                    failures.push(CitationFailure {
                        field,
                        error: e.to_string(),
                    });
                }
            }
        }

        CitationOutcome {
            extraction,
            failures,
        }
    }

    async fn cite_field(
        &self,
        field: ExtractionField,
        scope: &IndexFilter,
    ) -> crate::error::Result<Vec<Citation>> {
        let query = [field.topic_phrase().to_string()];
        let outcome = self.retriever.retrieve(scope, &query, self.candidates).await?;
        Ok(select_citations(
            &outcome.chunks,
            self.threshold,
            self.max_per_field,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedEmbedder, LruEmbeddingCache};
    use crate::chunker::Chunk;
    use crate::config::RetrievalConfig;
    use crate::embeddings::LocalEmbedder;
    use crate::error::{RagError, Result};
    use crate::vector_index::{ChunkMetadata, InMemoryVectorIndex, IndexRecord, VectorIndex};
    use async_trait::async_trait;

    fn hit(id: &str, distance: f32, page: Option<u32>) -> RetrievedChunk {
        RetrievedChunk {
            id: id.to_string(),
            chunk: Chunk {
                text: id.to_string(),
                chunk_index: 0,
                page_number: page,
                document_id: None,
                policy_id: None,
            },
            distance,
        }
    }

    fn chunk_ids(citations: &[Citation]) -> Vec<Option<String>> {
        citations.iter().map(|c| c.chunk_id.clone()).collect()
    }

    #[test]
    fn test_fallback_keeps_single_best() {
        let chunks = vec![hit("a", 0.5, Some(1)), hit("b", 0.6, Some(2))];
        let citations = select_citations(&chunks, 0.4, 2);
        assert_eq!(chunk_ids(&citations), vec![Some("a".to_string())]);
        assert_eq!(citations[0].page_number, Some(1));
    }

    #[test]
    fn test_threshold_filters() {
        let chunks = vec![hit("a", 0.1, Some(4)), hit("b", 0.5, None)];
        let citations = select_citations(&chunks, 0.4, 2);
        assert_eq!(chunk_ids(&citations), vec![Some("a".to_string())]);
    }

    #[test]
    fn test_max_per_field() {
        let chunks = vec![hit("a", 0.1, None), hit("b", 0.2, None), hit("c", 0.3, None)];
        assert_eq!(select_citations(&chunks, 0.4, 2).len(), 2);
        assert!(select_citations(&[], 0.4, 2).is_empty());
    }

    /// Fails every query; citation lookups go through it.
    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
            Ok(records.len())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _k: usize,
            _filter: &IndexFilter,
        ) -> Result<Vec<RetrievedChunk>> {
            Err(RagError::upstream("query", "broken", "index offline"))
        }

        async fn delete_by(&self, _filter: &IndexFilter) -> Result<usize> {
            Ok(0)
        }

        async fn count(&self, _filter: &IndexFilter) -> Result<usize> {
            Ok(0)
        }

        fn backend_name(&self) -> &str {
            "broken"
        }
    }

    fn matcher(index: Arc<dyn VectorIndex>) -> CitationMatcher {
        let embeddings = Arc::new(CachedEmbedder::new(
            Arc::new(LocalEmbedder::new(64)),
            Arc::new(LruEmbeddingCache::new(Some(64))),
        ));
        let retriever = Arc::new(MultiQueryRetriever::new(
            index,
            embeddings,
            &RetrievalConfig::default(),
        ));
        CitationMatcher::new(retriever, &CitationConfig::default())
    }

    #[tokio::test]
    async fn test_attach_citations_to_present_fields() {
        let embedder = LocalEmbedder::new(64);
        let texts = [
            "The annual deductible amount is $250 per incident.",
            "Reimbursement rate percentage: 80% coinsurance.",
        ];
        let index = Arc::new(InMemoryVectorIndex::new("policy_chunks"));
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
                    page_number: Some(i as u32 + 1),
                },
            })
            .collect();
        index.upsert(records).await.unwrap();

        let mut extraction = ExtractionResult::default();
        extraction.fields.deductible = Some(250.0);
        extraction.fields.reimbursement_rate = Some(80.0);

        let outcome = matcher(index)
            .attach_citations(extraction, &IndexFilter::for_policy("pol"))
            .await;

        assert!(outcome.failures.is_empty());
        let deductible = &outcome.extraction.citations[&ExtractionField::Deductible];
        assert_eq!(deductible[0].chunk_id.as_deref(), Some("doc_chunk_0"));
        assert_eq!(deductible[0].page_number, Some(1));
        let rate = &outcome.extraction.citations[&ExtractionField::ReimbursementRate];
        assert_eq!(rate[0].chunk_id.as_deref(), Some("doc_chunk_1"));
        assert!(
            !outcome
                .extraction
                .citations
                .contains_key(&ExtractionField::PlanName)
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_leaves_field_uncited() {
        let mut extraction = ExtractionResult::default();
        extraction.fields.deductible = Some(250.0);

        let outcome = matcher(Arc::new(BrokenIndex))
            .attach_citations(extraction.clone(), &IndexFilter::for_policy("pol"))
            .await;

        assert!(outcome.extraction.citations.is_empty());
        assert_eq!(outcome.extraction.fields, extraction.fields);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].field, ExtractionField::Deductible);
    }

    #[tokio::test]
    async fn test_nothing_present_means_no_lookups() {
        let outcome = matcher(Arc::new(BrokenIndex))
            .attach_citations(ExtractionResult::default(), &IndexFilter::for_policy("pol"))
            .await;
        assert!(outcome.failures.is_empty());
        assert!(outcome.extraction.citations.is_empty());
    }
}
