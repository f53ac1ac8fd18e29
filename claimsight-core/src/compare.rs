//! Topic-by-topic comparison of two policies.

use crate::coverage::SourceChunk;
use crate::error::{RagError, Result};
use crate::llm::{LanguageModel, LlmRequest};
use crate::prompts::{self, COMPARISON_SYSTEM};
use crate::retriever::{MultiQueryRetriever, QueryFailure, RetrievalOutcome};
use crate::vector_index::{IndexFilter, RetrievedChunk};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// Topics compared when the caller does not name any.
pub const DEFAULT_TOPICS: [&str; 6] = [
    "deductible",
    "reimbursement rate",
    "annual limit",
    "waiting periods",
    "exclusions",
    "monthly premium",
];

/// Evidence gathered for one topic from both policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicComparison {
    pub topic: String,
    pub evidence_a: Vec<SourceChunk>,
    pub evidence_b: Vec<SourceChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyComparison {
    pub policy_a: String,
    pub policy_b: String,
    pub topics: Vec<TopicComparison>,
    pub narrative: String,
    pub partial_failures: Vec<QueryFailure>,
}

/// Phrasings issued for one comparison topic.
pub fn topic_queries(topic: &str) -> Vec<String> {
    let topic = topic.trim();
    vec![
        topic.to_string(),
        format!("{topic} amount terms and conditions"),
        format!("{topic} limits exceptions"),
    ]
}

pub struct PolicyComparer {
    retriever: Arc<MultiQueryRetriever>,
    llm: Arc<dyn LanguageModel>,
    per_topic_k: usize,
}

impl PolicyComparer {
    pub fn new(
        retriever: Arc<MultiQueryRetriever>,
        llm: Arc<dyn LanguageModel>,
        per_topic_k: usize,
    ) -> Self {
        Self {
            retriever,
            llm,
            per_topic_k: per_topic_k.max(1),
        }
    }

    /// Compare `policy_a` with `policy_b` over `topics`, or over
    /// [`DEFAULT_TOPICS`] when `topics` is empty.
    pub async fn compare(
        &self,
        policy_a: &str,
        policy_b: &str,
        topics: &[String],
    ) -> Result<PolicyComparison> {
        if policy_a == policy_b {
            return Err(RagError::validation("cannot compare a policy with itself"));
        }
        let topics: Vec<String> = if topics.is_empty() {
            DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
        } else {
            topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        };
        if topics.is_empty() {
            return Err(RagError::validation("comparison topics are all blank"));
        }

        let label = format!("{policy_a}/{policy_b}");
        let scope_a = IndexFilter::for_policy(policy_a);
        let scope_b = IndexFilter::for_policy(policy_b);
        let lookups = topics.iter().flat_map(|topic| {
            [
                self.gather(&scope_a, topic),
                self.gather(&scope_b, topic),
            ]
        });
        let mut results = futures::future::join_all(lookups).await.into_iter();

        let mut partial_failures = Vec::new();
        let mut failed_lookups = 0;
        let mut comparisons = Vec::with_capacity(topics.len());
        let mut evidence_text = String::new();
        for topic in &topics {
            let (Some(a), Some(b)) = (results.next(), results.next()) else {
                break;
            };
            let hits_a = match a {
                Ok(outcome) => evidence(outcome, policy_a, &mut partial_failures),
                Err(e) => {
                    failed_lookups += 1;
                    lookup_failed(e, policy_a, topic, &mut partial_failures)
                }
            };
            let hits_b = match b {
                Ok(outcome) => evidence(outcome, policy_b, &mut partial_failures),
                Err(e) => {
                    failed_lookups += 1;
                    lookup_failed(e, policy_b, topic, &mut partial_failures)
                }
            };

            let _ = writeln!(evidence_text, "## {topic}\n### Policy A\n{}", render(&hits_a));
            let _ = writeln!(evidence_text, "### Policy B\n{}", render(&hits_b));

            comparisons.push(TopicComparison {
                topic: topic.clone(),
                evidence_a: hits_a.iter().map(SourceChunk::from).collect(),
                evidence_b: hits_b.iter().map(SourceChunk::from).collect(),
            });
        }

        if failed_lookups == topics.len() * 2 {
            return Err(RagError::upstream(
                "compare_policies",
                label,
                "every topic retrieval failed",
            ));
        }

        let has_evidence = comparisons
            .iter()
            .any(|c| !c.evidence_a.is_empty() || !c.evidence_b.is_empty());
        let narrative = if has_evidence {
            let prompt = format!(
                "Compare Policy A ({policy_a}) with Policy B ({policy_b}).\n\n{evidence_text}"
            );
            self.llm
                .complete(&LlmRequest::new(COMPARISON_SYSTEM, prompt))
                .await
                .map_err(|e| e.in_scope("compare_policies", &label))?
        } else {
            "Not enough information was found in either policy to compare them.".to_string()
        };

        info!(
            policy_a,
            policy_b,
            topics = comparisons.len(),
            failed = partial_failures.len(),
            "Policies compared"
        );

        Ok(PolicyComparison {
            policy_a: policy_a.to_string(),
            policy_b: policy_b.to_string(),
            topics: comparisons,
            narrative,
            partial_failures,
        })
    }

    async fn gather(&self, scope: &IndexFilter, topic: &str) -> Result<RetrievalOutcome> {
        self.retriever
            .retrieve(scope, &topic_queries(topic), self.per_topic_k)
            .await
    }
}

/// Keep a lookup's evidence and record the phrasings that failed within it.
fn evidence(
    outcome: RetrievalOutcome,
    policy_id: &str,
    failures: &mut Vec<QueryFailure>,
) -> Vec<RetrievedChunk> {
    failures.extend(outcome.failures.into_iter().map(|f| QueryFailure {
        query: format!("{policy_id}: {}", f.query),
        error: f.error,
    }));
    outcome.chunks
}

fn lookup_failed(
    error: RagError,
    policy_id: &str,
    topic: &str,
    failures: &mut Vec<QueryFailure>,
) -> Vec<RetrievedChunk> {
    warn!(
        policy_id,
        topic,
        error = %error,
        "Topic retrieval failed; comparing without it"
    );
    failures.push(QueryFailure {
        query: format!("{policy_id}: {topic}"),
        error: error.to_string(),
    });
    Vec::new()
}

fn render(hits: &[RetrievedChunk]) -> String {
    if hits.is_empty() {
        "(no evidence found)\n".to_string()
    } else {
        prompts::format_evidence(hits)
    }
}
