use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ragpipe::commands::{delete, ingest, init_config, list, query, reconcile, show_config, status};
use ragpipe::config::Config;
use ragpipe::pipeline::RepairMode;
use ragpipe::{RagError, Result};

#[derive(Parser)]
#[command(name = "ragpipe")]
#[command(about = "Document ingestion and retrieval pipeline for RAG")]
#[command(version)]
struct Cli {
    /// Data directory holding config, metadata, and vectors
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or initialize the configuration
    Config {
        /// Write the current configuration to disk
        #[arg(long)]
        init: bool,
    },
    /// Ingest a file, or every file in a directory
    Ingest {
        /// File or directory to ingest
        path: PathBuf,
    },
    /// Search the indexed documents and print ranked context
    Query {
        /// Query text
        text: String,
        /// Number of chunks to return
        #[arg(short, long)]
        k: Option<usize>,
        /// Restrict results to one document by source name
        #[arg(long)]
        document: Option<String>,
    },
    /// List all ingested documents
    List,
    /// Delete a document by source name
    Delete {
        /// Source name to delete
        source: String,
    },
    /// Check metadata and vector stores for drift
    Reconcile {
        /// Repair any drift found: "rollback" or "reembed"
        #[arg(long)]
        repair: Option<String>,
    },
    /// Show connectivity and pipeline health
    Status,
}

fn parse_repair_mode(value: &str) -> Result<RepairMode> {
    match value {
        "rollback" => Ok(RepairMode::Rollback),
        "reembed" => Ok(RepairMode::Reembed),
        other => Err(RagError::InvalidInput(format!(
            "unknown repair mode '{other}' (expected 'rollback' or 'reembed')"
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let base_dir = match cli.data_dir {
        Some(dir) => dir,
        None => Config::default_base_dir()?,
    };
    let config = Config::load(&base_dir)?;

    match cli.command {
        Commands::Config { init } => {
            if init {
                init_config(&config)?;
            } else {
                show_config(&config)?;
            }
        }
        Commands::Ingest { path } => {
            ingest(config, path).await?;
        }
        Commands::Query { text, k, document } => {
            query(config, text, k, document).await?;
        }
        Commands::List => {
            list(config).await?;
        }
        Commands::Delete { source } => {
            delete(config, source).await?;
        }
        Commands::Reconcile { repair } => {
            let mode = repair.as_deref().map(parse_repair_mode).transpose()?;
            reconcile(config, mode).await?;
        }
        Commands::Status => {
            status(config).await?;
        }
    }

    Ok(())
}
