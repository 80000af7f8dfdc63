use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::models::{ChunkRecord, Document, DocumentStatus, NewChunk, NewDocument, ReadyChunk};
use crate::{RagError, Result};

const DOCUMENT_COLUMNS: &str = "id, source_name, media_type, content_hash, status, \
     model_version, error_message, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "id, document_id, sequence_index, content, char_length, embedding_id, created_at";

pub struct DocumentQueries;

impl DocumentQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, new_document: NewDocument) -> Result<Document> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO documents (id, source_name, media_type, content_hash, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&new_document.id)
        .bind(&new_document.source_name)
        .bind(&new_document.media_type)
        .bind(&new_document.content_hash)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_id(pool, &new_document.id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {}", new_document.id)))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(document)
    }

    #[inline]
    pub async fn get_by_source_name(
        pool: &SqlitePool,
        source_name: &str,
    ) -> Result<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_name = ?"
        ))
        .bind(source_name)
        .fetch_optional(pool)
        .await?;

        Ok(document)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Document>> {
        let documents = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(pool)
        .await?;

        Ok(documents)
    }

    /// Documents whose ingestion started but never reached `Ready` or
    /// `Failed`.
    #[inline]
    pub async fn list_in_flight(pool: &SqlitePool) -> Result<Vec<Document>> {
        let documents = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE status IN ('pending', 'extracting', 'chunked', 'embedding') \
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(pool)
        .await?;

        Ok(documents)
    }

    #[inline]
    pub async fn set_status(pool: &SqlitePool, id: &str, status: DocumentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("document {id}")));
        }

        debug!("Document {} moved to status {}", id, status);
        Ok(())
    }

    /// Record the media type discovered by sniffing, which can differ from
    /// what the caller declared.
    #[inline]
    pub async fn set_media_type(pool: &SqlitePool, id: &str, media_type: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE documents SET media_type = ?, updated_at = ? WHERE id = ?")
                .bind(media_type)
                .bind(Utc::now().naive_utc())
                .bind(id)
                .execute(pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("document {id}")));
        }

        Ok(())
    }

    #[inline]
    pub async fn mark_ready(pool: &SqlitePool, id: &str, model_version: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'ready', model_version = ?, error_message = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(model_version)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("document {id}")));
        }

        Ok(())
    }

    #[inline]
    pub async fn mark_failed(pool: &SqlitePool, id: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("document {id}")));
        }

        Ok(())
    }

    /// Delete a document; its chunks cascade. Returns false when no such
    /// document existed.
    #[inline]
    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    /// Insert a document's chunks atomically; either the full sequence lands
    /// or none of it does.
    #[inline]
    pub async fn insert_batch(pool: &SqlitePool, chunks: &[NewChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, sequence_index, content, char_length, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.sequence_index)
            .bind(&chunk.content)
            .bind(chunk.char_length)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Inserted {} chunks", chunks.len());
        Ok(())
    }

    #[inline]
    pub async fn list_by_document(
        pool: &SqlitePool,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>> {
        let chunks = sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY sequence_index ASC"
        ))
        .bind(document_id)
        .fetch_all(pool)
        .await?;

        Ok(chunks)
    }

    #[inline]
    pub async fn ids_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM chunks WHERE document_id = ? ORDER BY sequence_index ASC",
        )
        .bind(document_id)
        .fetch_all(pool)
        .await?;

        Ok(ids)
    }

    /// Hydrate chunks by id, restricted to documents that are `Ready`.
    /// Chunks of documents mid-ingestion or failed never reach query results.
    #[inline]
    pub async fn get_ready_by_ids(pool: &SqlitePool, ids: &[String]) -> Result<Vec<ReadyChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.document_id, d.source_name, c.sequence_index, c.content \
             FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE d.status = 'ready' AND c.id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let chunks = builder
            .build_query_as::<ReadyChunk>()
            .fetch_all(pool)
            .await?;

        Ok(chunks)
    }

    /// Stamp every chunk of a document as embedded. The embedding id equals
    /// the chunk id, so this is a single sweep after the vector upsert.
    #[inline]
    pub async fn mark_embedded(pool: &SqlitePool, document_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE chunks SET embedding_id = id WHERE document_id = ?")
            .bind(document_id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn count_for_document(pool: &SqlitePool, document_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(pool)
                .await?;

        Ok(count)
    }

    #[inline]
    pub async fn count_embedded_for_document(
        pool: &SqlitePool,
        document_id: &str,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ? AND embedding_id IS NOT NULL",
        )
        .bind(document_id)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

}
