//! Configuration system for Claimsight.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.

use crate::error::{RagError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub citation: CitationConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Document chunking parameters, measured in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default), "openai", "ollama"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Provider-specific model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Embedding dimensions (provider default if 0).
    #[serde(default)]
    pub dimensions: usize,
    /// Batch size for bulk embedding at ingestion time.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Override for the provider base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

fn default_embedding_provider() -> String {
    "local".into()
}

fn default_batch_size() -> usize {
    32
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dimensions: 0,
            batch_size: default_batch_size(),
            base_url: None,
            api_key_env: default_openai_key_env(),
        }
    }
}

/// Query-embedding cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached query embeddings; `0` means unbounded.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_capacity() -> usize {
    10_000
}

impl CacheConfig {
    /// Entry bound for the LRU, or `None` for an unbounded cache.
    pub fn bound(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

/// Multi-query retrieval fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of evidence chunks when the caller does not say.
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Maximum topic queries in flight at once.
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
    /// Per-query timeout in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_k() -> usize {
    10
}

fn default_max_concurrent_queries() -> usize {
    6
}

fn default_query_timeout_secs() -> u64 {
    30
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_concurrent_queries: default_max_concurrent_queries(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Field-level citation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationConfig {
    /// Cosine distance a chunk must stay under to count as supporting evidence.
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
    /// Citations kept per field.
    #[serde(default = "default_max_per_field")]
    pub max_per_field: usize,
    /// Chunks retrieved per field before filtering.
    #[serde(default = "default_candidates_per_field")]
    pub candidates_per_field: usize,
}

fn default_distance_threshold() -> f32 {
    0.4
}

fn default_max_per_field() -> usize {
    2
}

fn default_candidates_per_field() -> usize {
    3
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_distance_threshold(),
            max_per_field: default_max_per_field(),
            candidates_per_field: default_candidates_per_field(),
        }
    }
}

/// Which vector index backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Vector index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    /// Collection that chunk embeddings are written to.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Database path for the SQLite backend.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_collection() -> String {
    "policy_chunks".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".claimsight/vectors.db")
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Memory,
            collection: default_collection(),
            db_path: default_db_path(),
        }
    }
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai" (any OpenAI-compatible endpoint) or "mock".
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_provider() -> String {
    "openai".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            api_key_env: default_openai_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(RagError::validation("chunking.chunk_size must be positive"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(RagError::validation(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::validation("embedding.batch_size must be positive"));
        }
        if self.retrieval.max_concurrent_queries == 0 {
            return Err(RagError::validation(
                "retrieval.max_concurrent_queries must be positive",
            ));
        }
        if self.retrieval.query_timeout_secs == 0 {
            return Err(RagError::validation(
                "retrieval.query_timeout_secs must be positive",
            ));
        }
        let threshold = self.citation.distance_threshold;
        if !(0.0..=2.0).contains(&threshold) {
            return Err(RagError::validation(format!(
                "citation.distance_threshold {threshold} is outside the cosine distance range [0, 2]"
            )));
        }
        if self.citation.max_per_field == 0 || self.citation.candidates_per_field == 0 {
            return Err(RagError::validation(
                "citation.max_per_field and citation.candidates_per_field must be positive",
            ));
        }
        Ok(())
    }
}

/// Path of the workspace-local config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".claimsight").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `CLAIMSIGHT_`)
/// 3. Workspace-local config (`.claimsight/config.toml`)
/// 4. User config (`~/.config/claimsight/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "claimsight", "claimsight") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // CLAIMSIGHT_RETRIEVAL__QUERY_TIMEOUT_SECS, CLAIMSIGHT_LLM__MODEL, ...
    figment = figment.merge(Env::prefixed("CLAIMSIGHT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: PipelineConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Write the default configuration to `<workspace>/.claimsight/config.toml`.
///
/// Returns the path written. An existing file is left untouched.
pub fn write_default_config(workspace: &Path) -> Result<PathBuf> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = toml::to_string_pretty(&PipelineConfig::default())
        .map_err(|e| RagError::validation(format!("failed to render default config: {e}")))?;
    std::fs::write(&path, rendered)?;
    Ok(path)
}
