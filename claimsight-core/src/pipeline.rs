//! End-to-end policy pipeline.
//!
//! `PolicyPipeline` owns every component (chunker, embedding client and
//! its cache, vector index, retriever, citation matcher and language
//! model) and exposes the operations callers use: ingest, search, delete,
//! incident analysis, question answering, comparison and structured
//! extraction.

use crate::cache::{CacheStats, CachedEmbedder, EmbeddingCache, LruEmbeddingCache};
use crate::chunker::{Chunk, Chunker};
use crate::citation::{CitationFailure, CitationMatcher};
use crate::compare::{PolicyComparer, PolicyComparison};
use crate::config::PipelineConfig;
use crate::coverage::{CoverageAnalysis, CoverageAnalyzer, SourceChunk};
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{RagError, Result};
use crate::extraction::{Confidence, ExtractionField, ExtractionResult, parse_json_object};
use crate::llm::{LanguageModel, LlmRequest, create_language_model};
use crate::prompts::{self, ANSWER_SYSTEM, EXTRACTION_SYSTEM};
use crate::retriever::{MultiQueryRetriever, QueryFailure};
use crate::validator;
use crate::vector_index::{
    ChunkMetadata, IndexFilter, IndexRecord, RetrievedChunk, VectorIndex, open_vector_index,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Evidence chunks gathered for a full policy extraction.
const EXTRACTION_EVIDENCE: usize = 24;

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub policy_id: Option<String>,
    pub chunks: usize,
    pub stored: usize,
    pub duration_ms: u64,
}

/// Answer to a free-form question about a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceChunk>,
    pub partial_failures: Vec<QueryFailure>,
}

/// A validated, cited extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitedExtraction {
    pub extraction: ExtractionResult,
    pub overall_confidence: Confidence,
    pub citation_failures: Vec<CitationFailure>,
    pub partial_failures: Vec<QueryFailure>,
}

impl CitedExtraction {
    fn uncited(extraction: ExtractionResult, partial_failures: Vec<QueryFailure>) -> Self {
        Self {
            overall_confidence: extraction.overall_confidence(),
            extraction,
            citation_failures: Vec::new(),
            partial_failures,
        }
    }
}

/// Index and cache status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub backend: String,
    pub total_chunks: usize,
    pub embedding_provider: String,
    pub model: String,
    pub cache: CacheStats,
}

pub struct PolicyPipeline {
    config: PipelineConfig,
    chunker: Chunker,
    embeddings: Arc<CachedEmbedder>,
    index: Arc<dyn VectorIndex>,
    retriever: Arc<MultiQueryRetriever>,
    citations: CitationMatcher,
    coverage: CoverageAnalyzer,
    comparer: PolicyComparer,
    llm: Arc<dyn LanguageModel>,
}

impl PolicyPipeline {
    /// Assemble a pipeline with an LRU cache sized from configuration.
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let cache = Arc::new(LruEmbeddingCache::new(config.cache.bound()));
        Self::with_cache(config, embedder, cache, index, llm)
    }

    /// Assemble a pipeline around a caller-owned embedding cache.
    pub fn with_cache(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        cache: Arc<dyn EmbeddingCache>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = Chunker::from_config(&config.chunking)?;
        let embeddings = Arc::new(CachedEmbedder::new(embedder, cache));
        let retriever = Arc::new(MultiQueryRetriever::new(
            index.clone(),
            embeddings.clone(),
            &config.retrieval,
        ));
        let citations = CitationMatcher::new(retriever.clone(), &config.citation);
        let coverage = CoverageAnalyzer::new(retriever.clone(), llm.clone());
        let comparer =
            PolicyComparer::new(retriever.clone(), llm.clone(), config.retrieval.default_k);

        Ok(Self {
            config,
            chunker,
            embeddings,
            index,
            retriever,
            citations,
            coverage,
            comparer,
            llm,
        })
    }

    /// Build every component from configuration.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = open_vector_index(&config.vector_index)?;
        let llm = create_language_model(&config.llm)?;
        Self::new(config, embedder, index, llm)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn retriever(&self) -> &Arc<MultiQueryRetriever> {
        &self.retriever
    }

    // --- ingestion -------------------------------------------------------

    /// Split a document into chunks using the configured sizes.
    pub fn chunk_document(
        &self,
        text: &str,
        page_count: u32,
        document_id: Option<&str>,
        policy_id: Option<&str>,
    ) -> Vec<Chunk> {
        self.chunker.chunk_document(text, page_count, document_id, policy_id)
    }

    /// Embed `chunks` in batches and upsert them under `document_id`.
    ///
    /// Returns the number of records written. Storage ids are
    /// `"{document_id}_chunk_{chunk_index}"`, so re-storing a document
    /// overwrites its previous chunks.
    pub async fn store_chunks(
        &self,
        chunks: &[Chunk],
        document_id: &str,
        policy_id: Option<&str>,
    ) -> Result<usize> {
        let document_id = require_id(document_id, "document id")?;
        let policy_id = policy_id.map(str::trim).filter(|p| !p.is_empty());
        let embedder = self.embeddings.embedder();
        let mut stored = 0;

        for batch in chunks.chunks(self.config.embedding.batch_size.max(1)) {
            let documents: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder
                .embed_batch(&documents)
                .await
                .map_err(|e| e.in_scope("store_chunks", document_id))?;
            let ids = batch
                .iter()
                .map(|c| Chunk::storage_id(document_id, c.chunk_index))
                .collect();
            let metadatas = batch
                .iter()
                .map(|c| ChunkMetadata {
                    document_id: document_id.to_string(),
                    policy_id: policy_id
                        .map(str::to_string)
                        .or_else(|| c.policy_id.clone()),
                    chunk_index: c.chunk_index,
                    page_number: c.page_number,
                })
                .collect();
            let records = IndexRecord::zip(ids, vectors, documents, metadatas)
                .map_err(|e| e.in_scope("store_chunks", document_id))?;
            stored += self
                .index
                .upsert(records)
                .await
                .map_err(|e| e.in_scope("store_chunks", document_id))?;
            debug!(document_id, stored, "Stored chunk batch");
        }

        info!(document_id, ?policy_id, stored, "Chunks stored");
        Ok(stored)
    }

    /// Chunk and store a document in one step.
    pub async fn ingest_document(
        &self,
        text: &str,
        page_count: u32,
        document_id: &str,
        policy_id: Option<&str>,
    ) -> Result<IngestReport> {
        let start = Instant::now();
        let document_id = require_id(document_id, "document id")?;
        let chunks = self.chunk_document(text, page_count, Some(document_id), policy_id);
        let stored = self.store_chunks(&chunks, document_id, policy_id).await?;
        Ok(IngestReport {
            document_id: document_id.to_string(),
            policy_id: policy_id.map(str::to_string),
            chunks: chunks.len(),
            stored,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    // --- search and deletion ---------------------------------------------

    /// Up to `k` chunks most similar to `query`, optionally scoped.
    pub async fn query_similar_chunks(
        &self,
        query: &str,
        k: usize,
        document_id: Option<&str>,
        policy_id: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>> {
        let filter = IndexFilter {
            document_id: document_id.map(str::to_string),
            policy_id: policy_id.map(str::to_string),
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        self.retriever
            .query_once(query, k, &filter)
            .await
            .map_err(|e| e.in_scope("query_similar_chunks", &filter.scope_label()))
    }

    pub async fn delete_chunks_by_document(&self, document_id: &str) -> Result<usize> {
        let document_id = require_id(document_id, "document id")?;
        let removed = self
            .index
            .delete_by(&IndexFilter::for_document(document_id))
            .await
            .map_err(|e| e.in_scope("delete_chunks_by_document", document_id))?;
        info!(document_id, removed, "Deleted document chunks");
        Ok(removed)
    }

    pub async fn delete_chunks_by_policy(&self, policy_id: &str) -> Result<usize> {
        let policy_id = require_id(policy_id, "policy id")?;
        let removed = self
            .index
            .delete_by(&IndexFilter::for_policy(policy_id))
            .await
            .map_err(|e| e.in_scope("delete_chunks_by_policy", policy_id))?;
        info!(policy_id, removed, "Deleted policy chunks");
        Ok(removed)
    }

    // --- embedding cache -------------------------------------------------

    pub async fn get_or_embed(&self, query: &str) -> Result<Arc<[f32]>> {
        self.embeddings
            .get_or_embed(query)
            .await
            .map_err(|e| e.in_scope("get_or_embed", "query_cache"))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.embeddings.stats()
    }

    pub fn clear_cache(&self) {
        self.embeddings.clear();
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            backend: self.index.backend_name().to_string(),
            total_chunks: self.index.count(&IndexFilter::default()).await?,
            embedding_provider: self.embeddings.embedder().provider_name().to_string(),
            model: self.llm.model_name().to_string(),
            cache: self.cache_stats(),
        })
    }

    // --- synthesis -------------------------------------------------------

    /// Assess whether `incident` is covered by the policy.
    pub async fn analyze_incident_coverage(
        &self,
        policy_id: &str,
        incident: &str,
        k: Option<usize>,
    ) -> Result<CoverageAnalysis> {
        let policy_id = require_id(policy_id, "policy id")?;
        let k = k.unwrap_or(self.config.retrieval.default_k).max(1);
        self.coverage.analyze(policy_id, incident, k).await
    }

    /// Validate a raw extraction and attach citations from the policy.
    pub async fn validate_and_cite(
        &self,
        raw: &serde_json::Value,
        policy_id: &str,
    ) -> Result<CitedExtraction> {
        let policy_id = require_id(policy_id, "policy id")?;
        let extraction = validator::validate(raw);
        Ok(self.cite(extraction, policy_id, Vec::new()).await)
    }

    /// Extract the policy's key terms with the language model, then
    /// validate and cite them.
    pub async fn extract_policy_summary(&self, policy_id: &str) -> Result<CitedExtraction> {
        let policy_id = require_id(policy_id, "policy id")?;
        let scope = IndexFilter::for_policy(policy_id);
        let queries: Vec<String> = ExtractionField::ALL
            .iter()
            .map(|f| f.topic_phrase().to_string())
            .collect();
        let outcome = self
            .retriever
            .retrieve(&scope, &queries, EXTRACTION_EVIDENCE)
            .await?;

        if outcome.chunks.is_empty() {
            info!(policy_id, "No evidence to extract from");
            return Ok(CitedExtraction::uncited(
                ExtractionResult::default(),
                outcome.failures,
            ));
        }

        let prompt = format!(
            "Policy excerpts:\n{}",
            prompts::format_evidence(&outcome.chunks)
        );
        let reply = self
            .llm
            .complete(&LlmRequest::new(EXTRACTION_SYSTEM, prompt).json())
            .await
            .map_err(|e| e.in_scope("extract_policy_summary", policy_id))?;

        match parse_json_object(&reply) {
            Ok(raw) => {
                let extraction = validator::validate(&raw);
                Ok(self.cite(extraction, policy_id, outcome.failures).await)
            }
            Err(e) => {
                warn!(policy_id, error = %e, "Extraction reply could not be decoded");
                Ok(CitedExtraction::uncited(
                    ExtractionResult::degraded(),
                    outcome.failures,
                ))
            }
        }
    }

    /// Answer a free-form question from the policy's own text.
    pub async fn answer_question(
        &self,
        policy_id: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<Answer> {
        let policy_id = require_id(policy_id, "policy id")?;
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::validation("question is empty"));
        }
        let k = k.unwrap_or(self.config.retrieval.default_k).max(1);
        let queries = vec![
            question.to_string(),
            format!("{question} policy terms conditions"),
        ];
        let outcome = self
            .retriever
            .retrieve(&IndexFilter::for_policy(policy_id), &queries, k)
            .await?;

        if outcome.chunks.is_empty() {
            return Ok(Answer {
                answer: "The policy documents do not contain enough information to answer \
                         this question."
                    .to_string(),
                sources: Vec::new(),
                partial_failures: outcome.failures,
            });
        }

        let prompt = format!(
            "Question: {question}\n\nPolicy excerpts:\n{}",
            prompts::format_evidence(&outcome.chunks)
        );
        let answer = self
            .llm
            .complete(&LlmRequest::new(ANSWER_SYSTEM, prompt))
            .await
            .map_err(|e| e.in_scope("answer_question", policy_id))?;

        Ok(Answer {
            answer: answer.trim().to_string(),
            sources: outcome.chunks.iter().map(SourceChunk::from).collect(),
            partial_failures: outcome.failures,
        })
    }

    /// Compare two policies topic by topic.
    pub async fn compare_policies(
        &self,
        policy_a: &str,
        policy_b: &str,
        topics: &[String],
    ) -> Result<PolicyComparison> {
        let policy_a = require_id(policy_a, "first policy id")?;
        let policy_b = require_id(policy_b, "second policy id")?;
        self.comparer.compare(policy_a, policy_b, topics).await
    }

    async fn cite(
        &self,
        extraction: ExtractionResult,
        policy_id: &str,
        partial_failures: Vec<QueryFailure>,
    ) -> CitedExtraction {
        let outcome = self
            .citations
            .attach_citations(extraction, &IndexFilter::for_policy(policy_id))
            .await;
        CitedExtraction {
            overall_confidence: outcome.extraction.overall_confidence(),
            extraction: outcome.extraction,
            citation_failures: outcome.failures,
            partial_failures,
        }
    }
}

fn require_id<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RagError::validation(format!("{what} is required")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::llm::MockLanguageModel;
    use crate::vector_index::InMemoryVectorIndex;

    fn pipeline() -> PolicyPipeline {
        PolicyPipeline::new(
            PipelineConfig::default(),
            Arc::new(LocalEmbedder::new(64)),
            Arc::new(InMemoryVectorIndex::default()),
            Arc::new(MockLanguageModel::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_require_id() {
        assert_eq!(require_id(" pol-1 ", "policy id").unwrap(), "pol-1");
        assert!(matches!(
            require_id("  ", "policy id"),
            Err(RagError::Validation { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        let result = PolicyPipeline::new(
            config,
            Arc::new(LocalEmbedder::new(8)),
            Arc::new(InMemoryVectorIndex::default()),
            Arc::new(MockLanguageModel::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_store_chunks_uses_storage_ids() {
        let pipeline = pipeline();
        let chunks = vec![
            Chunk {
                text: "first".into(),
                chunk_index: 0,
                page_number: Some(1),
                document_id: None,
                policy_id: None,
            },
            Chunk {
                text: "second".into(),
                chunk_index: 1,
                page_number: None,
                document_id: None,
                policy_id: Some("from-chunk".into()),
            },
        ];
        let stored = pipeline.store_chunks(&chunks, "doc-9", None).await.unwrap();
        assert_eq!(stored, 2);

        let hits = pipeline
            .query_similar_chunks("second", 1, Some("doc-9"), None)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "doc-9_chunk_1");
        assert_eq!(hits[0].chunk.page_number, None);
        assert_eq!(hits[0].chunk.policy_id.as_deref(), Some("from-chunk"));
    }

    #[tokio::test]
    async fn test_blank_ids_rejected() {
        let pipeline = pipeline();
        assert!(pipeline.store_chunks(&[], " ", None).await.is_err());
        assert!(pipeline.delete_chunks_by_policy("").await.is_err());
        assert!(
            pipeline
                .analyze_incident_coverage("", "fell down stairs", None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_query_with_zero_k_is_empty() {
        let pipeline = pipeline();
        let hits = pipeline
            .query_similar_chunks("deductible", 0, None, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let pipeline = pipeline();
        pipeline
            .ingest_document("Annual deductible is $250.", 1, "doc", Some("pol"))
            .await
            .unwrap();
        let status = pipeline.status().await.unwrap();
        assert_eq!(status.backend, "memory");
        assert_eq!(status.total_chunks, 1);
        assert_eq!(status.model, "mock-model");
    }
}
