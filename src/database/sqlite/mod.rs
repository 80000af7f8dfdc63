
pub mod models;
pub mod queries;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use crate::Result;
use crate::database::sqlite::models::{
    ChunkRecord, Document, DocumentStatus, DocumentSummary, NewChunk, NewDocument, ReadyChunk,
};
use crate::database::sqlite::queries::{ChunkQueries, DocumentQueries};

pub type DbPool = Pool<Sqlite>;

/// The metadata store: source of truth for documents and chunks. The vector
/// index is derived from this and reconciled against it.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    // Document operations

    pub async fn create_document(&self, new_document: NewDocument) -> Result<Document> {
        DocumentQueries::create(&self.pool, new_document).await
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        DocumentQueries::get_by_id(&self.pool, id).await
    }

    pub async fn get_document_by_source(&self, source_name: &str) -> Result<Option<Document>> {
        DocumentQueries::get_by_source_name(&self.pool, source_name).await
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        DocumentQueries::list_all(&self.pool).await
    }

    pub async fn in_flight_documents(&self) -> Result<Vec<Document>> {
        DocumentQueries::list_in_flight(&self.pool).await
    }

    pub async fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        DocumentQueries::set_status(&self.pool, id, status).await
    }

    pub async fn set_document_media_type(&self, id: &str, media_type: &str) -> Result<()> {
        DocumentQueries::set_media_type(&self.pool, id, media_type).await
    }

    pub async fn mark_document_ready(&self, id: &str, model_version: &str) -> Result<()> {
        DocumentQueries::mark_ready(&self.pool, id, model_version).await
    }

    pub async fn mark_document_failed(&self, id: &str, message: &str) -> Result<()> {
        DocumentQueries::mark_failed(&self.pool, id, message).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        DocumentQueries::delete(&self.pool, id).await
    }

    pub async fn document_summary(&self, document: Document) -> Result<DocumentSummary> {
        let chunk_count = ChunkQueries::count_for_document(&self.pool, &document.id).await?;
        let embedded_count =
            ChunkQueries::count_embedded_for_document(&self.pool, &document.id).await?;

        Ok(DocumentSummary {
            document,
            chunk_count,
            embedded_count,
        })
    }

    // Chunk operations

    pub async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        ChunkQueries::insert_batch(&self.pool, chunks).await
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        ChunkQueries::list_by_document(&self.pool, document_id).await
    }

    pub async fn chunk_ids_for_document(&self, document_id: &str) -> Result<Vec<String>> {
        ChunkQueries::ids_for_document(&self.pool, document_id).await
    }

    pub async fn ready_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<ReadyChunk>> {
        ChunkQueries::get_ready_by_ids(&self.pool, ids).await
    }

    pub async fn mark_chunks_embedded(&self, document_id: &str) -> Result<u64> {
        ChunkQueries::mark_embedded(&self.pool, document_id).await
    }
}
