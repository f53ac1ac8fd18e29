//! # Claimsight Core
//!
//! Retrieval-augmented synthesis over insurance policy documents.
//! Provides chunking, embedding with a query cache, vector index backends,
//! multi-query retrieval, confidence validation of model extractions,
//! citation matching, and the `PolicyPipeline` that ties them together.

pub mod cache;
pub mod chunker;
pub mod citation;
pub mod compare;
pub mod config;
pub mod coverage;
pub mod embeddings;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod retriever;
pub mod validator;
pub mod vector_index;

// Re-export commonly used types at the crate root.
pub use cache::{CacheStats, CachedEmbedder, EmbeddingCache, LruEmbeddingCache};
pub use chunker::{Chunk, Chunker};
pub use citation::{CitationFailure, CitationMatcher, CitationOutcome};
pub use compare::{PolicyComparison, TopicComparison};
pub use config::{PipelineConfig, load_config};
pub use coverage::{CoverageAnalysis, SourceChunk};
pub use embeddings::{Embedder, LocalEmbedder, create_embedder};
pub use error::{RagError, Result};
pub use extraction::{Citation, Confidence, ExtractionField, ExtractionResult, PolicyFields};
pub use llm::{LanguageModel, LlmRequest, MockLanguageModel};
pub use pipeline::{Answer, CitedExtraction, IngestReport, PipelineStatus, PolicyPipeline};
pub use retriever::{MultiQueryRetriever, QueryFailure, RetrievalOutcome};
pub use vector_index::{
    InMemoryVectorIndex, IndexFilter, RetrievedChunk, SqliteVectorIndex, VectorIndex,
};
