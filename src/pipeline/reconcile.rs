//! Drift detection and repair between the metadata store and the vector
//! index. The metadata store is authoritative; the vector store must be
//! brought back in line with it, never the other way around.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::database::lancedb::{VectorRecord, VectorStore};
use crate::database::sqlite::Database;
use crate::database::sqlite::models::DocumentStatus;
use crate::{RagError, Result};

use super::Pipeline;

/// How [`repair`] restores consistency for a drifted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Drop the document's vectors and mark it `Failed`; it must be
    /// re-ingested to become queryable again.
    Rollback,
    /// Re-embed every chunk from the metadata store and rebuild the
    /// document's vectors, finishing at `Ready`.
    Reembed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    /// Ingestion started but never reached a terminal status; vectors may be
    /// partially written.
    StuckInFlight,
    /// A `Ready` document is missing vectors for some of its chunks.
    MissingVectors,
    /// Vectors exist that no current chunk accounts for.
    OrphanedVectors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDrift {
    pub document_id: String,
    pub source_name: String,
    pub status: DocumentStatus,
    pub kind: DriftKind,
    pub missing_vector_ids: Vec<String>,
    pub orphaned_vector_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked_documents: usize,
    pub drifted: Vec<DocumentDrift>,
    /// Document ids present in the vector store with no metadata record at
    /// all.
    pub orphaned_documents: Vec<String>,
}

impl ReconcileReport {
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.drifted.is_empty() && self.orphaned_documents.is_empty()
    }
}

/// Walk every document and compare its chunk ids against the vectors the
/// index actually holds.
pub(super) async fn detect(
    database: &Database,
    vector_store: &VectorStore,
) -> Result<ReconcileReport> {
    let documents = database.list_documents().await?;
    let mut drifted = Vec::new();
    let mut known_ids = HashSet::with_capacity(documents.len());

    for document in &documents {
        known_ids.insert(document.id.clone());

        // Failed documents must not contribute vectors; everything else is
        // expected to match its chunk rows.
        let expected: HashSet<String> = if document.is_failed() {
            HashSet::new()
        } else {
            database
                .chunk_ids_for_document(&document.id)
                .await?
                .into_iter()
                .collect()
        };
        let actual: HashSet<String> = vector_store
            .ids_for_document(&document.id)
            .await?
            .into_iter()
            .collect();

        let mut missing: Vec<String> = expected.difference(&actual).cloned().collect();
        let mut orphaned: Vec<String> = actual.difference(&expected).cloned().collect();
        missing.sort_unstable();
        orphaned.sort_unstable();

        let kind = if document.is_in_flight() {
            Some(DriftKind::StuckInFlight)
        } else if document.is_ready() && !missing.is_empty() {
            Some(DriftKind::MissingVectors)
        } else if !orphaned.is_empty() {
            Some(DriftKind::OrphanedVectors)
        } else {
            None
        };

        if let Some(kind) = kind {
            warn!(
                "Document {} ({}) has drifted: {:?}, {} missing, {} orphaned",
                document.source_name,
                document.id,
                kind,
                missing.len(),
                orphaned.len()
            );
            drifted.push(DocumentDrift {
                document_id: document.id.clone(),
                source_name: document.source_name.clone(),
                status: document.status,
                kind,
                missing_vector_ids: missing,
                orphaned_vector_ids: orphaned,
            });
        }
    }

    let orphaned_documents: Vec<String> = vector_store
        .document_ids()
        .await?
        .into_iter()
        .filter(|id| !known_ids.contains(id))
        .collect();

    if !orphaned_documents.is_empty() {
        warn!(
            "Vector store holds {} documents with no metadata record",
            orphaned_documents.len()
        );
    }

    Ok(ReconcileReport {
        checked_documents: documents.len(),
        drifted,
        orphaned_documents,
    })
}

/// Apply the chosen repair to every drifted document. After a successful
/// repair a fresh [`detect`] pass reports consistency.
pub(super) async fn repair(
    pipeline: &Pipeline,
    report: &ReconcileReport,
    mode: RepairMode,
) -> Result<()> {
    for document_id in &report.orphaned_documents {
        info!("Dropping orphaned vectors for unknown document {document_id}");
        pipeline.vector_store.delete_document(document_id).await?;
    }

    for drift in &report.drifted {
        match mode {
            RepairMode::Rollback => rollback_document(pipeline, drift).await?,
            RepairMode::Reembed => reembed_document(pipeline, drift).await?,
        }
    }

    Ok(())
}

async fn rollback_document(pipeline: &Pipeline, drift: &DocumentDrift) -> Result<()> {
    info!(
        "Rolling back drifted document {} ({})",
        drift.source_name, drift.document_id
    );

    pipeline
        .vector_store
        .delete_document(&drift.document_id)
        .await?;

    if drift.status != DocumentStatus::Failed {
        pipeline
            .database
            .mark_document_failed(&drift.document_id, "rolled back by reconciliation")
            .await?;
    }

    Ok(())
}

async fn reembed_document(pipeline: &Pipeline, drift: &DocumentDrift) -> Result<()> {
    let chunks = pipeline
        .database
        .chunks_for_document(&drift.document_id)
        .await?;

    if chunks.is_empty() {
        // Nothing to rebuild from; rollback is the only consistent outcome.
        warn!(
            "Document {} has no chunks to re-embed, rolling back instead",
            drift.document_id
        );
        return rollback_document(pipeline, drift).await;
    }

    info!(
        "Re-embedding {} chunks for drifted document {} ({})",
        chunks.len(),
        drift.source_name,
        drift.document_id
    );

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
    let client = pipeline.embedding_client.clone();
    let vectors = tokio::task::spawn_blocking(move || client.embed_batch(&texts))
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("embedding task panicked: {e}")))??;

    let model_version = pipeline.embedding_client.model_version().to_string();
    let records: Vec<VectorRecord> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| VectorRecord {
            id: chunk.id.clone(),
            document_id: drift.document_id.clone(),
            vector,
            model_version: model_version.clone(),
        })
        .collect();

    // Clear first so vectors for deleted chunks cannot survive the rebuild.
    pipeline
        .vector_store
        .delete_document(&drift.document_id)
        .await?;
    pipeline.vector_store.upsert(&records).await?;

    pipeline
        .database
        .mark_chunks_embedded(&drift.document_id)
        .await?;
    pipeline
        .database
        .mark_document_ready(&drift.document_id, &model_version)
        .await?;

    Ok(())
}
