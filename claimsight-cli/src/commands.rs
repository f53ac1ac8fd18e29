//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::DeleteTarget;
use claimsight_core::config::{PipelineConfig, VectorBackend};
use claimsight_core::llm::create_language_model;
use claimsight_core::vector_index::open_vector_index;
use claimsight_core::{Chunker, LanguageModel, MockLanguageModel, PolicyPipeline};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Chunk { file, pages } => handle_chunk(&file, pages, workspace),
        Commands::Ingest {
            file,
            pages,
            document_id,
            policy_id,
        } => handle_ingest(&file, pages, document_id, policy_id, workspace).await,
        Commands::Query {
            query,
            k,
            document_id,
            policy_id,
        } => {
            let pipeline = open_pipeline(workspace, false)?;
            let k = k.unwrap_or(pipeline.config().retrieval.default_k);
            let hits = pipeline
                .query_similar_chunks(&query, k, document_id.as_deref(), policy_id.as_deref())
                .await?;
            print_json(&hits)
        }
        Commands::Delete { target } => handle_delete(target, workspace).await,
        Commands::Analyze {
            policy_id,
            incident,
            k,
        } => {
            let pipeline = open_pipeline(workspace, true)?;
            let analysis = pipeline
                .analyze_incident_coverage(&policy_id, &incident, k)
                .await?;
            print_json(&analysis)
        }
        Commands::Ask {
            policy_id,
            question,
            k,
        } => {
            let pipeline = open_pipeline(workspace, true)?;
            let answer = pipeline.answer_question(&policy_id, &question, k).await?;
            print_json(&answer)
        }
        Commands::Compare {
            policy_a,
            policy_b,
            topics,
        } => {
            let pipeline = open_pipeline(workspace, true)?;
            let comparison = pipeline
                .compare_policies(&policy_a, &policy_b, &topics)
                .await?;
            print_json(&comparison)
        }
        Commands::Validate { file, policy_id } => {
            let raw: serde_json::Value = serde_json::from_str(&read_input(&file)?)
                .map_err(|e| anyhow::anyhow!("{} is not valid JSON: {}", file.display(), e))?;
            let pipeline = open_pipeline(workspace, false)?;
            let cited = pipeline.validate_and_cite(&raw, &policy_id).await?;
            print_json(&cited)
        }
        Commands::Extract { policy_id } => {
            let pipeline = open_pipeline(workspace, true)?;
            let cited = pipeline.extract_policy_summary(&policy_id).await?;
            print_json(&cited)
        }
        Commands::Status => {
            let pipeline = open_pipeline(workspace, false)?;
            print_json(&pipeline.status().await?)
        }
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = claimsight_core::config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let written = claimsight_core::config::write_default_config(workspace)?;
            println!("Created default configuration at: {}", written.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_workspace_config(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_chunk(file: &Path, pages: u32, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let chunker = Chunker::from_config(&config.chunking)?;
    let text = read_input(file)?;
    print_json(&chunker.chunk(&text, pages))
}

async fn handle_ingest(
    file: &Path,
    pages: u32,
    document_id: Option<String>,
    policy_id: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let pipeline = open_pipeline(workspace, false)?;
    if pipeline.config().vector_index.backend == VectorBackend::Memory {
        warn!("vector_index.backend is \"memory\"; ingested chunks are discarded on exit");
    }
    let document_id = document_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let text = read_input(file)?;
    let report = pipeline
        .ingest_document(&text, pages, &document_id, policy_id.as_deref())
        .await?;
    info!(
        document_id = %report.document_id,
        chunks = report.chunks,
        duration_ms = report.duration_ms,
        "Ingested {}",
        file.display()
    );
    print_json(&report)
}

async fn handle_delete(target: DeleteTarget, workspace: &Path) -> anyhow::Result<()> {
    let pipeline = open_pipeline(workspace, false)?;
    let (scope, deleted) = match target {
        DeleteTarget::Document { document_id } => {
            let deleted = pipeline.delete_chunks_by_document(&document_id).await?;
            (format!("document {document_id}"), deleted)
        }
        DeleteTarget::Policy { policy_id } => {
            let deleted = pipeline.delete_chunks_by_policy(&policy_id).await?;
            (format!("policy {policy_id}"), deleted)
        }
    };
    println!("Deleted {deleted} chunk(s) for {scope}");
    Ok(())
}

fn load_workspace_config(workspace: &Path) -> anyhow::Result<PipelineConfig> {
    let mut config = claimsight_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.vector_index.db_path = resolve_db_path(workspace, &config.vector_index.db_path);
    Ok(config)
}

/// Relative database paths are taken from the workspace, not the process cwd.
fn resolve_db_path(workspace: &Path, db_path: &Path) -> PathBuf {
    if db_path.is_absolute() {
        db_path.to_path_buf()
    } else {
        workspace.join(db_path)
    }
}

/// Build the pipeline for `workspace`.
///
/// Commands that never call the language model still work when its
/// credentials are missing: the model falls back to an inert mock.
fn open_pipeline(workspace: &Path, needs_model: bool) -> anyhow::Result<PolicyPipeline> {
    let config = load_workspace_config(workspace)?;
    let embedder = claimsight_core::create_embedder(&config.embedding)?;
    let index = open_vector_index(&config.vector_index)?;
    let llm: Arc<dyn LanguageModel> = match create_language_model(&config.llm) {
        Ok(llm) => llm,
        Err(e) if !needs_model => {
            tracing::debug!(error = %e, "Language model unavailable; not needed for this command");
            Arc::new(MockLanguageModel::new())
        }
        Err(e) => return Err(anyhow::anyhow!("Language model setup failed: {}", e)),
    };
    Ok(PolicyPipeline::new(config, embedder, index, llm)?)
}

fn read_input(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
