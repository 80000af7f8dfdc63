use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("Document too large: {size} bytes (limit {limit})")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("Invalid chunking configuration: {0}")]
    InvalidChunkConfig(String),

    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Embedding provider rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    #[error("Vector dimension mismatch: got {got}, collection expects {expected}")]
    DimensionMismatch { got: usize, expected: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Reconciliation drift: {0}")]
    ReconciliationDrift(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Transient provider errors are worth retrying; everything else fails fast.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::ProviderUnavailable(_) | RagError::RateLimited(_)
        )
    }
}

pub mod cache;
pub mod chunker;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod extract;
pub mod pipeline;
