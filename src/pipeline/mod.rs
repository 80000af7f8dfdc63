#[cfg(test)]
mod tests;

pub mod reconcile;

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::chunker::{self, TextChunk};
use crate::config::Config;
use crate::database::lancedb::{VectorRecord, VectorStore};
use crate::database::sqlite::Database;
use crate::database::sqlite::models::{
    Document, DocumentStatus, DocumentSummary, NewChunk, NewDocument,
};
use crate::embeddings::EmbeddingClient;
use crate::extract;
use crate::{RagError, Result};

pub use reconcile::{DocumentDrift, DriftKind, ReconcileReport, RepairMode};

/// What happened to one ingested document.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Extracted, chunked, embedded, and indexed.
    Ingested {
        document: Document,
        chunk_count: usize,
    },
    /// Content hash matches the stored `Ready` document; nothing touched.
    Unchanged { document: Document },
    /// The document contained no extractable text and was not recorded.
    SkippedEmpty,
}

/// One chunk of ranked context returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_name: String,
    pub sequence_index: i64,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub chunks: Vec<RetrievedChunk>,
    /// True when the result came from the query cache without touching the
    /// embedding provider or vector store.
    pub cached: bool,
}

/// Composes the ingestion path (extract, chunk, embed, index) and the query
/// path (cache, embed, search, hydrate). The metadata store is the source of
/// truth; the vector store is a derived index kept consistent by
/// [`Pipeline::reconcile`].
pub struct Pipeline {
    config: Config,
    database: Database,
    vector_store: VectorStore,
    embedding_client: EmbeddingClient,
    cache: QueryCache<Vec<RetrievedChunk>>,
}

impl Pipeline {
    pub async fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir)?;

        let database = Database::new(config.database_path()).await?;
        let vector_store = VectorStore::new(
            config.vector_database_path(),
            config.ollama.embedding_dimension as usize,
            config.retrieval.metric,
            &config.ollama.model,
        )
        .await?;
        let embedding_client = EmbeddingClient::new(&config.ollama)?;
        let cache = QueryCache::new(
            std::time::Duration::from_secs(config.retrieval.cache_ttl_seconds),
            config.retrieval.cache_capacity,
        );

        Ok(Self {
            config,
            database,
            vector_store,
            embedding_client,
            cache,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn vector_store(&self) -> &VectorStore {
        &self.vector_store
    }

    pub fn embedding_client(&self) -> &EmbeddingClient {
        &self.embedding_client
    }

    // Ingestion path

    /// Ingest one document. Re-ingesting identical content against a `Ready`
    /// document short-circuits without calling the embedding provider;
    /// changed content replaces the old document, its chunks, and its
    /// vectors.
    pub async fn ingest(
        &self,
        source_name: &str,
        bytes: &[u8],
        declared_media_type: Option<&str>,
    ) -> Result<IngestOutcome> {
        if source_name.trim().is_empty() {
            return Err(RagError::InvalidInput(
                "source name must not be blank".to_string(),
            ));
        }

        let content_hash = hash_bytes(bytes);

        if let Some(existing) = self.database.get_document_by_source(source_name).await? {
            if existing.is_ready() && existing.content_hash == content_hash {
                debug!(
                    "Document {} unchanged (hash {}), skipping",
                    source_name, content_hash
                );
                return Ok(IngestOutcome::Unchanged { document: existing });
            }

            info!(
                "Replacing document {} (status {}, content changed: {})",
                source_name,
                existing.status,
                existing.content_hash != content_hash
            );
            self.remove_document(&existing).await?;
        }

        // Record the document before touching its bytes, so a failed
        // extraction still leaves a Failed row to diagnose. The media type
        // starts from the caller's declaration and is corrected once the
        // content has been sniffed.
        let document = self
            .database
            .create_document(NewDocument {
                id: Uuid::new_v4().to_string(),
                source_name: source_name.to_string(),
                media_type: declared_media_type
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                content_hash,
            })
            .await?;
        self.database
            .set_document_status(&document.id, DocumentStatus::Extracting)
            .await?;

        let extracted = match extract::extract(
            bytes,
            declared_media_type,
            self.config.limits.max_document_bytes,
        ) {
            Ok((media_type, extracted)) => {
                self.database
                    .set_document_media_type(&document.id, media_type.as_str())
                    .await?;
                extracted
            }
            Err(error) => {
                warn!("Extraction of {} failed: {}", source_name, error);
                return Err(self.settle_failure(&document.id, error).await);
            }
        };

        if extracted.is_blank() {
            info!("Document {} contains no extractable text, skipping", source_name);
            self.database.delete_document(&document.id).await?;
            return Ok(IngestOutcome::SkippedEmpty);
        }

        match self.run_ingest_stages(&document, &extracted).await {
            Ok(chunk_count) => {
                self.cache.invalidate_all();
                let document = self
                    .database
                    .get_document(&document.id)
                    .await?
                    .ok_or_else(|| RagError::NotFound(format!("document {}", document.id)))?;

                info!(
                    "Ingested {} as {} ({} chunks)",
                    source_name, document.id, chunk_count
                );
                Ok(IngestOutcome::Ingested {
                    document,
                    chunk_count,
                })
            }
            Err(error) => {
                warn!("Ingestion of {} failed: {}", source_name, error);
                Err(self.settle_failure(&document.id, error).await)
            }
        }
    }

    /// Best-effort rollback after a failed stage: vectors are removed if the
    /// store cooperates, the document always ends `Failed` with the stage
    /// error recorded, and the stage error is what the caller sees. Chunks
    /// stay for re-embedding repair.
    async fn settle_failure(&self, document_id: &str, error: RagError) -> RagError {
        if let Err(delete_error) = self.vector_store.delete_document(document_id).await {
            warn!(
                "Could not roll back vectors for {}: {}",
                document_id, delete_error
            );
        }
        if let Err(mark_error) = self
            .database
            .mark_document_failed(document_id, &error.to_string())
            .await
        {
            warn!(
                "Could not mark document {} failed: {}",
                document_id, mark_error
            );
        }
        error
    }

    /// Ingest a file from disk, using the file name as the source name.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome> {
        let source_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                RagError::InvalidInput(format!("path has no usable file name: {}", path.display()))
            })?;

        let bytes = tokio::fs::read(path).await?;
        self.ingest(source_name, &bytes, declared_media_type_for(path))
            .await
    }

    async fn run_ingest_stages(
        &self,
        document: &Document,
        extracted: &extract::ExtractedText,
    ) -> Result<usize> {
        let chunks = chunker::chunk(extracted, &self.config.chunking)?;
        let new_chunks: Vec<NewChunk> = chunks
            .iter()
            .map(|chunk| NewChunk {
                id: Uuid::new_v4().to_string(),
                document_id: document.id.clone(),
                sequence_index: chunk.sequence_index as i64,
                content: chunk.text.clone(),
                char_length: chunk.char_length as i64,
            })
            .collect();

        self.database.insert_chunks(&new_chunks).await?;
        self.database
            .set_document_status(&document.id, DocumentStatus::Chunked)
            .await?;

        self.database
            .set_document_status(&document.id, DocumentStatus::Embedding)
            .await?;
        let vectors = self.embed_chunk_texts(&chunks).await?;

        let records: Vec<VectorRecord> = new_chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id.clone(),
                document_id: document.id.clone(),
                vector,
                model_version: self.embedding_client.model_version().to_string(),
            })
            .collect();
        self.vector_store.upsert(&records).await?;

        self.database.mark_chunks_embedded(&document.id).await?;
        self.database
            .mark_document_ready(&document.id, self.embedding_client.model_version())
            .await?;

        Ok(new_chunks.len())
    }

    async fn embed_chunk_texts(&self, chunks: &[TextChunk]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let client = self.embedding_client.clone();

        tokio::task::spawn_blocking(move || client.embed_batch(&texts))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("embedding task panicked: {e}")))?
    }

    // Query path

    /// Answer a query with ranked context: top-K nearest chunks, hydrated
    /// from the metadata store, restricted to `Ready` documents.
    pub async fn query(
        &self,
        text: &str,
        k: Option<usize>,
        document_filter: Option<&str>,
    ) -> Result<QueryOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RagError::InvalidInput(
                "query text must not be blank".to_string(),
            ));
        }
        let k = k.unwrap_or(self.config.retrieval.default_k);
        if k == 0 {
            return Err(RagError::InvalidInput("k must be at least 1".to_string()));
        }

        let cache_key = cache_key(
            self.embedding_client.model_version(),
            text,
            k,
            document_filter,
        );
        if let Some(chunks) = self.cache.get(&cache_key) {
            debug!("Query served from cache ({} chunks)", chunks.len());
            return Ok(QueryOutcome {
                chunks,
                cached: true,
            });
        }

        let query_vector = {
            let client = self.embedding_client.clone();
            let owned = text.to_string();
            tokio::task::spawn_blocking(move || client.embed_query(&owned))
                .await
                .map_err(|e| RagError::Other(anyhow::anyhow!("embedding task panicked: {e}")))??
        };

        let matches = self
            .vector_store
            .search(&query_vector, k, document_filter)
            .await?;

        let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
        let rows = self.database.ready_chunks_by_ids(&ids).await?;
        let by_id: std::collections::HashMap<&str, &crate::database::sqlite::models::ReadyChunk> =
            rows.iter().map(|row| (row.id.as_str(), row)).collect();

        let mut chunks = Vec::with_capacity(matches.len());
        for hit in &matches {
            match by_id.get(hit.chunk_id.as_str()) {
                Some(row) => chunks.push(RetrievedChunk {
                    chunk_id: row.id.clone(),
                    document_id: row.document_id.clone(),
                    source_name: row.source_name.clone(),
                    sequence_index: row.sequence_index,
                    text: row.content.clone(),
                    score: hit.score,
                }),
                // A hit without a hydratable row means the stores have
                // drifted; drop it from results and let reconcile report it.
                None => warn!(
                    "Vector hit {} has no ready chunk row, skipping",
                    hit.chunk_id
                ),
            }
        }

        self.cache.insert(cache_key, chunks.clone());
        Ok(QueryOutcome {
            chunks,
            cached: false,
        })
    }

    // Management

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let documents = self.database.list_documents().await?;
        let mut summaries = Vec::with_capacity(documents.len());
        for document in documents {
            summaries.push(self.database.document_summary(document).await?);
        }
        Ok(summaries)
    }

    /// Delete a document by source name, removing its metadata, chunks, and
    /// vectors.
    pub async fn delete(&self, source_name: &str) -> Result<Document> {
        let document = self
            .database
            .get_document_by_source(source_name)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {source_name}")))?;

        self.remove_document(&document).await?;
        info!("Deleted document {} ({})", source_name, document.id);
        Ok(document)
    }

    /// Abandon an in-flight ingestion: drop whatever vectors it already
    /// wrote and mark the document `Failed`, so reconcile sees a settled
    /// state instead of drift.
    pub async fn cancel(&self, document_id: &str) -> Result<Document> {
        let document = self
            .database
            .get_document(document_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;

        if !document.is_in_flight() {
            return Err(RagError::InvalidInput(format!(
                "document {} is not in flight (status {})",
                document_id, document.status
            )));
        }

        // Best-effort on the derived index: even if the vector store is
        // down, the document must settle at Failed so reconcile can finish
        // the cleanup later.
        if let Err(delete_error) = self.vector_store.delete_document(&document.id).await {
            warn!(
                "Could not roll back vectors for {}: {}",
                document.id, delete_error
            );
        }
        self.database
            .mark_document_failed(&document.id, "ingestion cancelled")
            .await?;
        self.cache.invalidate_all();

        info!("Cancelled ingestion of {} ({})", document.source_name, document.id);
        self.database
            .get_document(&document.id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))
    }

    async fn remove_document(&self, document: &Document) -> Result<()> {
        // Vectors first: a crash between the two deletes leaves orphaned
        // metadata, which reconcile treats as authoritative, rather than
        // orphaned vectors that could surface in search results.
        self.vector_store.delete_document(&document.id).await?;
        self.database.delete_document(&document.id).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Compare the metadata store against the vector store and report every
    /// disagreement.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile::detect(&self.database, &self.vector_store).await
    }

    /// Repair the drift found by [`Pipeline::reconcile`].
    pub async fn repair(&self, report: &ReconcileReport, mode: RepairMode) -> Result<()> {
        reconcile::repair(self, report, mode).await?;
        self.cache.invalidate_all();
        Ok(())
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Cache entries are keyed on everything that can change the answer: the
/// model producing the query vector, K, the document filter, and the query
/// text with its whitespace collapsed.
fn cache_key(model_version: &str, text: &str, k: usize, document_filter: Option<&str>) -> String {
    let normalized: Vec<&str> = text.split_whitespace().collect();
    format!(
        "{}:{}:{}:{}",
        model_version,
        k,
        document_filter.unwrap_or(""),
        normalized.join(" ")
    )
}

fn declared_media_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "html" | "htm" => Some("text/html"),
        "txt" | "md" => Some("text/plain"),
        "docx" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        "xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        "xls" => Some("application/vnd.ms-excel"),
        _ => None,
    }
}
