#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType};
use tracing::{debug, info};

use crate::config::DistanceMetric;
use crate::{RagError, Result};

/// One logical collection per embedding model version, so vectors from
/// different models never mix in one index.
fn collection_name(model_version: &str) -> String {
    let sanitized: String = model_version
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("embeddings_{sanitized}")
}

/// One vector row: the id is the chunk id, 1:1. Chunk text lives in the
/// metadata store; the vector table only carries what search and
/// reconciliation need.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// A raw nearest-neighbor hit, before hydration from the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub model_version: String,
    pub distance: f32,
    /// Higher is better; `1.0 - distance` by convention.
    pub score: f32,
}

/// Vector index derived from the metadata store. Fully rebuildable from it
/// plus re-embedding, so every operation here is safe to retry.
#[derive(Clone)]
pub struct VectorStore {
    connection: Connection,
    table_name: String,
    dimension: usize,
    distance_type: DistanceType,
}

impl VectorStore {
    /// Open (or create) the vector database at `path`, using the collection
    /// for `model_version`. If that collection already exists its stored
    /// dimension must match `dimension`.
    pub async fn new<P: AsRef<Path>>(
        path: P,
        dimension: usize,
        metric: DistanceMetric,
        model_version: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let uri = format!("file://{}", path.display());
        debug!("Connecting to vector store at {}", uri);

        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("connect failed: {e}")))?;

        let store = Self {
            connection,
            table_name: collection_name(model_version),
            dimension,
            distance_type: match metric {
                DistanceMetric::Cosine => DistanceType::Cosine,
                DistanceMetric::Euclidean => DistanceType::L2,
            },
        };
        store.initialize_table().await?;

        info!(
            "Vector store ready at {} ({}, {} dimensions)",
            path.display(),
            store.table_name,
            dimension
        );
        Ok(store)
    }

    async fn initialize_table(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("failed to list tables: {e}")))?;

        if table_names.iter().any(|name| *name == self.table_name) {
            let existing = self.stored_dimension().await?;
            if existing != self.dimension {
                return Err(RagError::DimensionMismatch {
                    got: self.dimension,
                    expected: existing,
                });
            }
            return Ok(());
        }

        self.connection
            .create_empty_table(&self.table_name, self.schema())
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("failed to create table: {e}")))?;

        Ok(())
    }

    async fn stored_dimension(&self) -> Result<usize> {
        let table = self.open_table().await?;
        let schema = table
            .schema()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("failed to read schema: {e}")))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(RagError::VectorStoreUnavailable(
            "embeddings table has no vector column".to_string(),
        ))
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dimension as i32,
                ),
                false,
            ),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("model_version", DataType::Utf8, false),
        ]))
    }

    async fn open_table(&self) -> Result<lancedb::Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("failed to open table: {e}")))
    }

    /// Insert or replace vectors by id. Re-running the same upsert leaves the
    /// store unchanged: existing rows with matching ids are replaced, never
    /// duplicated.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            if record.vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    got: record.vector.len(),
                    expected: self.dimension,
                });
            }
        }

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let table = self.open_table().await?;

        table
            .delete(&id_predicate(&ids))
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("upsert delete failed: {e}")))?;

        let batch = self.create_record_batch(records)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("upsert add failed: {e}")))?;

        debug!("Upserted {} vectors", records.len());
        Ok(())
    }

    fn create_record_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        let mut flat_values = Vec::with_capacity(records.len() * self.dimension);
        let mut ids = Vec::with_capacity(records.len());
        let mut document_ids = Vec::with_capacity(records.len());
        let mut model_versions = Vec::with_capacity(records.len());

        for record in records {
            flat_values.extend_from_slice(&record.vector);
            ids.push(record.id.as_str());
            document_ids.push(record.document_id.as_str());
            model_versions.push(record.model_version.as_str());
        }

        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            item_field,
            self.dimension as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| RagError::VectorStoreUnavailable(format!("bad vector array: {e}")))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(document_ids)),
            Arc::new(StringArray::from(model_versions)),
        ];

        RecordBatch::try_new(self.schema(), arrays)
            .map_err(|e| RagError::VectorStoreUnavailable(format!("bad record batch: {e}")))
    }

    /// Nearest neighbors of `query_vector`, at most `limit` hits, optionally
    /// restricted to one document. Ties are broken by chunk id so repeated
    /// searches return a stable order.
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<VectorMatch>> {
        if query_vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                got: query_vector.len(),
                expected: self.dimension,
            });
        }

        let table = self.open_table().await?;
        let mut query = table
            .vector_search(query_vector)
            .map_err(|e| RagError::VectorStoreUnavailable(format!("search failed: {e}")))?
            .column("vector")
            .distance_type(self.distance_type)
            .limit(limit);

        if let Some(document_id) = document_filter {
            query = query.only_if(format!("document_id = '{}'", escape(document_id)));
        }

        let mut stream = query
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("search failed: {e}")))?;

        let mut matches = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("search stream failed: {e}")))?
        {
            matches.extend(parse_search_batch(&batch)?);
        }

        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(limit);

        debug!("Vector search returned {} matches", matches.len());
        Ok(matches)
    }

    /// All chunk ids currently indexed for a document, used to reconcile
    /// against the metadata store.
    pub async fn ids_for_document(&self, document_id: &str) -> Result<Vec<String>> {
        let table = self.open_table().await?;

        let mut stream = table
            .query()
            .only_if(format!("document_id = '{}'", escape(document_id)))
            .select(Select::Columns(vec!["id".to_string()]))
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("id scan failed: {e}")))?;

        let mut ids = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("id scan failed: {e}")))?
        {
            let column = string_column(&batch, "id")?;
            for row in 0..batch.num_rows() {
                ids.push(column.value(row).to_string());
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Distinct document ids present in the index, for orphan detection.
    pub async fn document_ids(&self) -> Result<Vec<String>> {
        let table = self.open_table().await?;

        let mut stream = table
            .query()
            .select(Select::Columns(vec!["document_id".to_string()]))
            .execute()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("document scan failed: {e}")))?;

        let mut ids = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("document scan failed: {e}")))?
        {
            let column = string_column(&batch, "document_id")?;
            for row in 0..batch.num_rows() {
                ids.push(column.value(row).to_string());
            }
        }

        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Drop one vector by chunk id. Deleting an id that is not indexed is a
    /// no-op.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let table = self.open_table().await?;
        table
            .delete(&format!("id = '{}'", escape(id)))
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("delete failed: {e}")))?;

        Ok(())
    }

    /// Drop every vector belonging to a document.
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let table = self.open_table().await?;
        table
            .delete(&format!("document_id = '{}'", escape(document_id)))
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("delete failed: {e}")))?;

        debug!("Deleted vectors for document {}", document_id);
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.open_table().await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| RagError::VectorStoreUnavailable(format!("count failed: {e}")))
    }
}

fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<VectorMatch>> {
    let chunk_ids = string_column(batch, "id")?;
    let document_ids = string_column(batch, "document_id")?;
    let model_versions = string_column(batch, "model_version")?;

    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    let mut matches = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });
        matches.push(VectorMatch {
            chunk_id: chunk_ids.value(row).to_string(),
            document_id: document_ids.value(row).to_string(),
            model_version: model_versions.value(row).to_string(),
            distance,
            score: 1.0 - distance,
        });
    }

    Ok(matches)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::VectorStoreUnavailable(format!("missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RagError::VectorStoreUnavailable(format!("invalid {name} column type")))
}

fn id_predicate(ids: &[&str]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{}'", escape(id))).collect();
    format!("id IN ({})", quoted.join(", "))
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}
