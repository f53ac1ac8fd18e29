//! Claimsight CLI: ingest policy documents and ask grounded questions about them.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Claimsight: retrieval-grounded answers about insurance policies
#[derive(Parser, Debug)]
#[command(name = "claimsight", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Split a text file into chunks and print them without storing
    Chunk {
        /// Plain-text policy document
        file: PathBuf,
        /// Number of pages in the source document
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Chunk, embed and store a policy document
    Ingest {
        /// Plain-text policy document
        file: PathBuf,
        /// Number of pages in the source document
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Document identifier (a random one is generated when omitted)
        #[arg(long)]
        document_id: Option<String>,
        /// Policy the document belongs to
        #[arg(long)]
        policy_id: Option<String>,
    },
    /// Find the chunks most similar to a query
    Query {
        /// Search text
        query: String,
        /// Number of chunks to return
        #[arg(short)]
        k: Option<usize>,
        /// Restrict to one document
        #[arg(long)]
        document_id: Option<String>,
        /// Restrict to one policy
        #[arg(long)]
        policy_id: Option<String>,
    },
    /// Delete stored chunks
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },
    /// Assess whether an incident is covered by a policy
    Analyze {
        /// Policy to check against
        #[arg(long)]
        policy_id: String,
        /// Description of what happened
        incident: String,
        /// Number of evidence chunks to gather
        #[arg(short)]
        k: Option<usize>,
    },
    /// Ask a free-form question about a policy
    Ask {
        /// Policy to answer from
        #[arg(long)]
        policy_id: String,
        /// The question
        question: String,
        /// Number of evidence chunks to gather
        #[arg(short)]
        k: Option<usize>,
    },
    /// Compare two policies topic by topic
    Compare {
        /// First policy
        policy_a: String,
        /// Second policy
        policy_b: String,
        /// Topic to compare (repeatable; defaults to the standard set)
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
    /// Validate an extraction JSON file and attach citations
    Validate {
        /// JSON object with extracted policy fields
        file: PathBuf,
        /// Policy the extraction was taken from
        #[arg(long)]
        policy_id: String,
    },
    /// Extract a policy's key terms with the language model
    Extract {
        /// Policy to summarize
        #[arg(long)]
        policy_id: String,
    },
    /// Show index, provider and cache status
    Status,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum DeleteTarget {
    /// Delete every chunk of one document
    Document {
        /// Document identifier
        document_id: String,
    },
    /// Delete every chunk of one policy
    Policy {
        /// Policy identifier
        policy_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "claimsight", "claimsight")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "claimsight.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::parse_from([
            "claimsight",
            "ingest",
            "policy.txt",
            "--pages",
            "12",
            "--policy-id",
            "pol-1",
        ]);
        match cli.command {
            Commands::Ingest {
                file,
                pages,
                document_id,
                policy_id,
            } => {
                assert_eq!(file, PathBuf::from("policy.txt"));
                assert_eq!(pages, 12);
                assert!(document_id.is_none());
                assert_eq!(policy_id.as_deref(), Some("pol-1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_compare_topics() {
        let cli = Cli::parse_from([
            "claimsight",
            "-vv",
            "compare",
            "gold",
            "silver",
            "--topic",
            "deductible",
            "--topic",
            "exclusions",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Compare {
                policy_a,
                policy_b,
                topics,
            } => {
                assert_eq!(policy_a, "gold");
                assert_eq!(policy_b, "silver");
                assert_eq!(topics, vec!["deductible", "exclusions"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete_policy() {
        let cli = Cli::parse_from(["claimsight", "delete", "policy", "pol-9"]);
        assert!(matches!(
            cli.command,
            Commands::Delete {
                target: DeleteTarget::Policy { ref policy_id }
            } if policy_id == "pol-9"
        ));
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["claimsight"]).is_err());
    }
}
