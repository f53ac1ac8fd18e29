//! Incident coverage analysis.
//!
//! An incident description is turned into six topic queries (the incident
//! itself, eligibility, exclusions, waiting periods, claim documentation
//! and cost sharing). The merged evidence is handed to the language model,
//! which answers with a JSON verdict.

use crate::error::{RagError, Result};
use crate::extraction::{Confidence, decode_response};
use crate::llm::{LanguageModel, LlmRequest};
use crate::prompts::{self, COVERAGE_SYSTEM};
use crate::retriever::{MultiQueryRetriever, QueryFailure};
use crate::vector_index::{IndexFilter, RetrievedChunk};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const EXCERPT_CHARS: usize = 300;

/// Evidence shown alongside an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChunk {
    pub chunk_id: String,
    pub page_number: Option<u32>,
    pub excerpt: String,
    pub distance: f32,
}

impl From<&RetrievedChunk> for SourceChunk {
    fn from(hit: &RetrievedChunk) -> Self {
        Self {
            chunk_id: hit.id.clone(),
            page_number: hit.chunk.page_number,
            excerpt: prompts::excerpt(&hit.chunk.text, EXCERPT_CHARS),
            distance: hit.distance,
        }
    }
}

/// Coverage verdict for one incident against one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageAnalysis {
    /// `None` when the evidence does not settle the question.
    pub is_covered: Option<bool>,
    pub confidence_level: Confidence,
    pub summary: String,
    pub covered_aspects: Vec<String>,
    pub excluded_aspects: Vec<String>,
    pub required_documents: Vec<String>,
    pub action_steps: Vec<String>,
    pub source_chunks: Vec<SourceChunk>,
    pub partial_failures: Vec<QueryFailure>,
    /// The model reply could not be decoded.
    pub degraded: bool,
}

impl CoverageAnalysis {
    /// Result for a policy with no relevant evidence.
    pub fn not_enough_information(partial_failures: Vec<QueryFailure>) -> Self {
        Self {
            is_covered: None,
            confidence_level: Confidence::Low,
            summary: "Not enough information was found in this policy to assess the incident."
                .to_string(),
            covered_aspects: Vec::new(),
            excluded_aspects: Vec::new(),
            required_documents: Vec::new(),
            action_steps: vec![
                "Contact the insurer to confirm how this incident would be handled.".to_string(),
            ],
            source_chunks: Vec::new(),
            partial_failures,
            degraded: false,
        }
    }

    fn degraded(source_chunks: Vec<SourceChunk>, partial_failures: Vec<QueryFailure>) -> Self {
        Self {
            summary: "The coverage analysis could not be completed; review the cited policy \
                      sections directly."
                .to_string(),
            action_steps: Vec::new(),
            source_chunks,
            degraded: true,
            ..Self::not_enough_information(partial_failures)
        }
    }
}

/// Shape of the model's JSON verdict.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoverageResponse {
    pub is_covered: Option<bool>,
    pub confidence_level: Option<Confidence>,
    pub summary: String,
    pub covered_aspects: Vec<String>,
    pub excluded_aspects: Vec<String>,
    pub required_documents: Vec<String>,
    pub action_steps: Vec<String>,
}

/// The six topic queries issued for an incident.
pub fn incident_queries(incident: &str) -> Vec<String> {
    let incident = incident.trim();
    vec![
        incident.to_string(),
        format!("{incident} covered conditions eligibility benefits"),
        format!("{incident} exclusions limitations not covered"),
        format!("waiting period pre-existing condition {incident}"),
        "claim submission required documents proof of loss veterinary records".to_string(),
        "deductible reimbursement rate annual limit per incident maximum".to_string(),
    ]
}

pub struct CoverageAnalyzer {
    retriever: Arc<MultiQueryRetriever>,
    llm: Arc<dyn LanguageModel>,
}

impl CoverageAnalyzer {
    pub fn new(retriever: Arc<MultiQueryRetriever>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { retriever, llm }
    }

    /// Analyze `incident` against the policy `policy_id` using up to `k`
    /// evidence chunks.
    pub async fn analyze(
        &self,
        policy_id: &str,
        incident: &str,
        k: usize,
    ) -> Result<CoverageAnalysis> {
        if incident.trim().is_empty() {
            return Err(RagError::validation("incident description is empty"));
        }
        let scope = IndexFilter::for_policy(policy_id);
        let outcome = self
            .retriever
            .retrieve(&scope, &incident_queries(incident), k)
            .await?;

        if outcome.chunks.is_empty() {
            info!(policy_id, "No evidence retrieved for incident");
            return Ok(CoverageAnalysis::not_enough_information(outcome.failures));
        }

        let prompt = format!(
            "Incident:\n{}\n\nPolicy excerpts:\n{}",
            incident.trim(),
            prompts::format_evidence(&outcome.chunks)
        );
        let reply = self
            .llm
            .complete(&LlmRequest::new(COVERAGE_SYSTEM, prompt).json())
            .await
            .map_err(|e| e.in_scope("analyze_incident_coverage", policy_id))?;

        let source_chunks: Vec<SourceChunk> =
            outcome.chunks.iter().map(SourceChunk::from).collect();
        let partial = outcome.is_partial();
        let response = match decode_response::<CoverageResponse>(&reply) {
            Ok(response) => response,
            Err(e) => {
                warn!(policy_id, error = %e, "Coverage reply could not be decoded");
                return Ok(CoverageAnalysis::degraded(source_chunks, outcome.failures));
            }
        };

        let mut confidence = response.confidence_level.unwrap_or(Confidence::Low);
        // Missing evidence from failed queries caps the verdict.
        if partial && confidence == Confidence::High {
            confidence = Confidence::Medium;
        }

        info!(
            policy_id,
            evidence = source_chunks.len(),
            failed_queries = outcome.failures.len(),
            is_covered = ?response.is_covered,
            confidence = %confidence,
            "Incident coverage analyzed"
        );

        Ok(CoverageAnalysis {
            is_covered: response.is_covered,
            confidence_level: confidence,
            summary: response.summary,
            covered_aspects: response.covered_aspects,
            excluded_aspects: response.excluded_aspects,
            required_documents: response.required_documents,
            action_steps: response.action_steps,
            source_chunks,
            partial_failures: outcome.failures,
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedEmbedder, LruEmbeddingCache};
    use crate::config::RetrievalConfig;
    use crate::embeddings::LocalEmbedder;
    use crate::llm::MockLanguageModel;
    use crate::vector_index::{ChunkMetadata, InMemoryVectorIndex, IndexRecord, VectorIndex};

    async fn analyzer(texts: &[&str], llm: Arc<MockLanguageModel>) -> CoverageAnalyzer {
        let embedder = LocalEmbedder::new(128);
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
                    page_number: Some(1),
                },
            })
            .collect();
        index.upsert(records).await.unwrap();
        let embeddings = Arc::new(CachedEmbedder::new(
            Arc::new(embedder),
            Arc::new(LruEmbeddingCache::new(None)),
        ));
        let retriever = Arc::new(MultiQueryRetriever::new(
            index,
            embeddings,
            &RetrievalConfig::default(),
        ));
        CoverageAnalyzer::new(retriever, llm)
    }

    #[test]
    fn test_incident_queries() {
        let queries = incident_queries("  broken leg after a fall ");
        assert_eq!(queries.len(), 6);
        assert_eq!(queries[0], "broken leg after a fall");
        assert!(queries[2].starts_with("broken leg after a fall exclusions"));
    }

    #[tokio::test]
    async fn test_no_evidence_skips_model() {
        let llm = Arc::new(MockLanguageModel::new());
        let analysis = analyzer(&[], llm.clone())
            .await
            .analyze("pol", "dog swallowed a sock", 10)
            .await
            .unwrap();
        assert_eq!(analysis.is_covered, None);
        assert_eq!(analysis.confidence_level, Confidence::Low);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_verdict_is_returned() {
        let llm = Arc::new(MockLanguageModel::with_response(
            r#"```json
{"isCovered": true, "confidenceLevel": "high", "summary": "Foreign body ingestion is an illness.",
 "coveredAspects": ["surgery"], "requiredDocuments": ["invoice"]}
```"#,
        ));
        let analysis = analyzer(
            &["Illness coverage includes surgery for foreign body ingestion."],
            llm.clone(),
        )
        .await
        .analyze("pol", "dog swallowed a sock", 10)
        .await
        .unwrap();

        assert_eq!(analysis.is_covered, Some(true));
        assert_eq!(analysis.confidence_level, Confidence::High);
        assert_eq!(analysis.covered_aspects, vec!["surgery".to_string()]);
        assert_eq!(analysis.source_chunks.len(), 1);
        assert!(!analysis.degraded);

        let request = &llm.requests()[0];
        assert!(request.json_mode);
        assert!(request.prompt.contains("[Source 1, page 1]"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_degrades() {
        let llm = Arc::new(MockLanguageModel::with_response("I think it is covered."));
        let analysis = analyzer(&["Accidents are covered after 2 days."], llm)
            .await
            .analyze("pol", "hit by a car", 5)
            .await
            .unwrap();
        assert!(analysis.degraded);
        assert_eq!(analysis.is_covered, None);
        assert_eq!(analysis.source_chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_incident_rejected() {
        let llm = Arc::new(MockLanguageModel::new());
        let result = analyzer(&[], llm).await.analyze("pol", "  ", 5).await;
        assert!(matches!(result, Err(RagError::Validation { .. })));
    }
}
