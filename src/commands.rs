use std::path::{Path, PathBuf};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pipeline::{DriftKind, IngestOutcome, Pipeline, ReconcileReport, RepairMode};
use crate::{RagError, Result};

/// How many documents a directory ingest runs at once.
const INGEST_CONCURRENCY: usize = 4;

/// Show the active configuration and where it lives.
pub fn show_config(config: &Config) -> Result<()> {
    println!("Configuration ({})", config.base_dir.join("config.toml").display());
    println!();
    println!("Ollama:");
    println!(
        "  Endpoint: {}://{}:{}",
        config.ollama.protocol, config.ollama.host, config.ollama.port
    );
    println!("  Model: {}", config.ollama.model);
    println!("  Batch Size: {}", config.ollama.batch_size);
    println!("  Embedding Dimension: {}", config.ollama.embedding_dimension);
    println!();
    println!("Chunking:");
    println!("  Target Size: {} chars", config.chunking.target_size);
    println!("  Min Size: {} chars", config.chunking.min_size);
    println!("  Overlap: {} chars", config.chunking.overlap);
    println!();
    println!("Retrieval:");
    println!("  Metric: {:?}", config.retrieval.metric);
    println!("  Default K: {}", config.retrieval.default_k);
    println!("  Cache TTL: {}s", config.retrieval.cache_ttl_seconds);
    println!("  Cache Capacity: {}", config.retrieval.cache_capacity);
    println!();
    println!("Limits:");
    println!("  Max Document Size: {} bytes", config.limits.max_document_bytes);

    Ok(())
}

/// Write the current configuration to disk, creating the data directory if
/// needed. Useful as a starting point for manual edits.
pub fn init_config(config: &Config) -> Result<()> {
    config.save()?;
    println!(
        "Configuration written to {}",
        config.base_dir.join("config.toml").display()
    );
    Ok(())
}

/// Ingest a file, or every file in a directory. One bad file in a directory
/// does not stop the rest.
pub async fn ingest(config: Config, path: PathBuf) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;

    if path.is_dir() {
        ingest_directory(&pipeline, &path).await
    } else {
        let outcome = pipeline.ingest_file(&path).await?;
        report_outcome(&path, &outcome);
        Ok(())
    }
}

async fn ingest_directory(pipeline: &Pipeline, dir: &Path) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'))
        })
        .collect();
    files.sort();

    if files.is_empty() {
        println!("No files found in {}", dir.display());
        return Ok(());
    }

    info!("Ingesting {} files from {}", files.len(), dir.display());

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| RagError::Other(anyhow::anyhow!("invalid progress template: {e}")))?,
    );

    let mut ingested = 0usize;
    let mut unchanged = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    // Source names are unique per file, so independent documents can ingest
    // concurrently without contending on the same metadata rows.
    let mut outcomes = futures::stream::iter(
        files
            .iter()
            .map(|file| async move { (file, pipeline.ingest_file(file).await) }),
    )
    .buffer_unordered(INGEST_CONCURRENCY);

    while let Some((file, result)) = outcomes.next().await {
        progress.set_message(
            file.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        match result {
            Ok(IngestOutcome::Ingested { .. }) => ingested += 1,
            Ok(IngestOutcome::Unchanged { .. }) => unchanged += 1,
            Ok(IngestOutcome::SkippedEmpty) => skipped += 1,
            Err(e) => {
                error!("Failed to ingest {}: {}", file.display(), e);
                failed += 1;
            }
        }

        progress.inc(1);
    }

    progress.finish_and_clear();

    println!("Ingestion complete:");
    println!("  Ingested: {ingested}");
    println!("  Unchanged: {unchanged}");
    println!("  Skipped (empty): {skipped}");
    println!("  Failed: {failed}");

    if failed > 0 {
        println!("Failed files are recorded with their errors; see 'list' for details.");
    }

    Ok(())
}

fn report_outcome(path: &Path, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Ingested {
            document,
            chunk_count,
        } => {
            println!(
                "Ingested {} as {} ({} chunks)",
                path.display(),
                document.id,
                chunk_count
            );
        }
        IngestOutcome::Unchanged { document } => {
            println!(
                "Unchanged: {} already indexed as {}",
                path.display(),
                document.id
            );
        }
        IngestOutcome::SkippedEmpty => {
            println!("Skipped {}: no extractable text", path.display());
        }
    }
}

/// Run a query and print the ranked context.
pub async fn query(
    config: Config,
    text: String,
    k: Option<usize>,
    document: Option<String>,
) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;

    let document_id = match document {
        Some(source_name) => {
            let doc = pipeline
                .database()
                .get_document_by_source(&source_name)
                .await?
                .ok_or_else(|| RagError::NotFound(format!("document {source_name}")))?;
            Some(doc.id)
        }
        None => None,
    };

    let outcome = pipeline.query(&text, k, document_id.as_deref()).await?;

    if outcome.chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (rank, chunk) in outcome.chunks.iter().enumerate() {
        println!(
            "#{} (score {:.4}, {}, chunk {})",
            rank + 1,
            chunk.score,
            chunk.source_name,
            chunk.sequence_index
        );
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

/// List every document with its status and chunk counts.
pub async fn list(config: Config) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;
    let summaries = pipeline.list_documents().await?;

    if summaries.is_empty() {
        println!("No documents have been ingested yet.");
        println!("Use 'ragpipe ingest <path>' to add one.");
        return Ok(());
    }

    println!("Documents ({} total):", summaries.len());
    println!();

    for summary in &summaries {
        let document = &summary.document;
        println!("{} ({})", document.source_name, document.id);
        println!("  Status: {}", document.status);
        println!("  Media Type: {}", document.media_type);
        println!(
            "  Chunks: {} ({} embedded)",
            summary.chunk_count, summary.embedded_count
        );
        if let Some(model) = &document.model_version {
            println!("  Model: {model}");
        }
        if let Some(error) = &document.error_message {
            println!("  Error: {error}");
        }
        println!(
            "  Updated: {}",
            document.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }

    Ok(())
}

/// Delete a document and everything derived from it.
pub async fn delete(config: Config, source_name: String) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;
    let document = pipeline.delete(&source_name).await?;
    println!("Deleted {} ({})", document.source_name, document.id);
    Ok(())
}

/// Check the metadata and vector stores against each other, optionally
/// repairing any drift.
pub async fn reconcile(config: Config, repair: Option<RepairMode>) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;
    let report = pipeline.reconcile().await?;

    println!("Checked {} documents.", report.checked_documents);

    if report.is_consistent() {
        println!("Stores are consistent.");
        return Ok(());
    }

    for drift in &report.drifted {
        let kind = match drift.kind {
            DriftKind::StuckInFlight => "stuck mid-ingestion",
            DriftKind::MissingVectors => "missing vectors",
            DriftKind::OrphanedVectors => "orphaned vectors",
        };
        println!(
            "  {} ({}): {} [status {}, {} missing, {} orphaned]",
            drift.source_name,
            drift.document_id,
            kind,
            drift.status,
            drift.missing_vector_ids.len(),
            drift.orphaned_vector_ids.len()
        );
    }

    if !report.orphaned_documents.is_empty() {
        println!(
            "  {} vector-store documents have no metadata record",
            report.orphaned_documents.len()
        );
    }

    match repair {
        Some(mode) => {
            pipeline.repair(&report, mode).await?;
            let after = pipeline.reconcile().await?;
            if after.is_consistent() {
                println!("Repair complete; stores are consistent.");
                Ok(())
            } else {
                warn!("Stores still inconsistent after repair");
                Err(RagError::ReconciliationDrift(drift_summary(&after)))
            }
        }
        None => Err(RagError::ReconciliationDrift(format!(
            "{}; run with '--repair rollback' or '--repair reembed' to fix",
            drift_summary(&report)
        ))),
    }
}

fn drift_summary(report: &ReconcileReport) -> String {
    format!(
        "{} drifted documents, {} orphaned vector-store documents",
        report.drifted.len(),
        report.orphaned_documents.len()
    )
}

/// Show connectivity and pipeline health.
pub async fn status(config: Config) -> Result<()> {
    println!("ragpipe status");
    println!("{}", "=".repeat(40));
    println!();

    println!("Ollama:");
    println!(
        "  Endpoint: {}://{}:{} (model {})",
        config.ollama.protocol, config.ollama.host, config.ollama.port, config.ollama.model
    );

    let pipeline = Pipeline::new(config).await?;

    let client = pipeline.embedding_client().clone();
    let health = tokio::task::spawn_blocking(move || client.health_check())
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("health check task panicked: {e}")))?;
    match health {
        Ok(()) => println!("  Reachable, model available"),
        Err(e) => println!("  Unavailable: {e}"),
    }
    println!();

    println!("Stores:");
    let documents = pipeline.database().list_documents().await?;
    let vectors = pipeline.vector_store().count().await?;
    println!("  Documents: {}", documents.len());
    println!("  Vectors: {vectors}");

    let ready = documents.iter().filter(|d| d.is_ready()).count();
    let failed = documents.iter().filter(|d| d.is_failed()).count();
    let in_flight = documents.iter().filter(|d| d.is_in_flight()).count();
    println!("  Ready: {ready}");
    println!("  Failed: {failed}");
    if in_flight > 0 {
        println!("  In Flight: {in_flight} (run 'reconcile' if no ingestion is active)");
    }
    println!();

    println!("Consistency:");
    let report = pipeline.reconcile().await?;
    if report.is_consistent() {
        println!("  Metadata and vector stores agree.");
    } else {
        println!(
            "  {} drifted documents, {} orphaned vector-store documents",
            report.drifted.len(),
            report.orphaned_documents.len()
        );
        println!("  Run 'ragpipe reconcile' for details.");
    }

    Ok(())
}
