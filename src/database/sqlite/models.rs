use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: String,
    pub source_name: String,
    pub media_type: String,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub model_version: Option<String>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Pipeline position of a document. Only `Ready` documents are visible to
/// queries; the in-flight states exist so a crash leaves evidence of where
/// ingestion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Chunked,
    Embedding,
    Ready,
    Failed,
}

impl std::fmt::Display for DocumentStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            DocumentStatus::Pending => write!(f, "Pending"),
            DocumentStatus::Extracting => write!(f, "Extracting"),
            DocumentStatus::Chunked => write!(f, "Chunked"),
            DocumentStatus::Embedding => write!(f, "Embedding"),
            DocumentStatus::Ready => write!(f, "Ready"),
            DocumentStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl Document {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.status == DocumentStatus::Ready
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.status == DocumentStatus::Failed
    }

    /// True while ingestion is underway; a document stuck in one of these
    /// states after a crash is what reconciliation looks for.
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            DocumentStatus::Pending
                | DocumentStatus::Extracting
                | DocumentStatus::Chunked
                | DocumentStatus::Embedding
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub id: String,
    pub source_name: String,
    pub media_type: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub sequence_index: i64,
    pub content: String,
    pub char_length: i64,
    /// Equal to `id` once the vector is upserted; NULL until then.
    pub embedding_id: Option<String>,
    pub created_at: NaiveDateTime,
}

/// A chunk hydrated for query results, joined with its document's source
/// name so callers can show where the text came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ReadyChunk {
    pub id: String,
    pub document_id: String,
    pub source_name: String,
    pub sequence_index: i64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: i64,
    pub content: String,
    pub char_length: i64,
}

/// A document together with its chunk bookkeeping, for listing and status
/// output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document: Document,
    pub chunk_count: i64,
    pub embedded_count: i64,
}
