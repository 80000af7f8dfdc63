use tempfile::TempDir;

use super::*;

const DIM: usize = 4;

const MODEL: &str = "bge-m3:latest";

async fn create_test_store() -> (TempDir, VectorStore) {
    let dir = TempDir::new().expect("should create temp dir");
    let store = VectorStore::new(dir.path().join("vectors"), DIM, DistanceMetric::Cosine, MODEL)
        .await
        .expect("should create vector store");
    (dir, store)
}

fn record(id: &str, document_id: &str, vector: Vec<f32>) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        document_id: document_id.to_string(),
        vector,
        model_version: "bge-m3:latest".to_string(),
    }
}

#[tokio::test]
async fn upsert_then_search_returns_nearest() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[
            record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
            record("chunk-b", "doc-1", vec![0.0, 1.0, 0.0, 0.0]),
            record("chunk-c", "doc-1", vec![0.0, 0.0, 1.0, 0.0]),
        ])
        .await
        .expect("should upsert");

    let matches = store
        .search(&[0.9, 0.1, 0.0, 0.0], 2, None)
        .await
        .expect("should search");

    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].chunk_id, "chunk-a");
    assert_eq!(matches[0].document_id, "doc-1");
    assert!(matches[0].distance <= matches[1].distance);
    assert!((matches[0].score - (1.0 - matches[0].distance)).abs() < f32::EPSILON);
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let (_dir, store) = create_test_store().await;
    let records = vec![
        record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
        record("chunk-b", "doc-1", vec![0.0, 1.0, 0.0, 0.0]),
    ];

    store.upsert(&records).await.expect("should upsert");
    store.upsert(&records).await.expect("should upsert again");

    assert_eq!(store.count().await.expect("should count"), 2);
}

#[tokio::test]
async fn upsert_replaces_existing_vector() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("should upsert");
    store
        .upsert(&[record("chunk-a", "doc-1", vec![0.0, 0.0, 0.0, 1.0])])
        .await
        .expect("should upsert replacement");

    assert_eq!(store.count().await.expect("should count"), 1);

    let matches = store
        .search(&[0.0, 0.0, 0.0, 1.0], 1, None)
        .await
        .expect("should search");
    assert_eq!(matches[0].chunk_id, "chunk-a");
    assert!(matches[0].distance < 0.01);
}

#[tokio::test]
async fn wrong_dimension_vector_is_rejected() {
    let (_dir, store) = create_test_store().await;

    let result = store
        .upsert(&[record("chunk-a", "doc-1", vec![1.0, 0.0])])
        .await;
    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            got: 2,
            expected: DIM
        })
    ));

    let result = store.search(&[1.0; 8], 5, None).await;
    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            got: 8,
            expected: DIM
        })
    ));
}

#[tokio::test]
async fn document_filter_restricts_results() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[
            record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
            record("chunk-b", "doc-2", vec![0.9, 0.1, 0.0, 0.0]),
        ])
        .await
        .expect("should upsert");

    let matches = store
        .search(&[1.0, 0.0, 0.0, 0.0], 5, Some("doc-2"))
        .await
        .expect("should search");

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].chunk_id, "chunk-b");
}

#[tokio::test]
async fn ids_for_document_lists_indexed_chunks() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[
            record("chunk-b", "doc-1", vec![0.0, 1.0, 0.0, 0.0]),
            record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
            record("chunk-c", "doc-2", vec![0.0, 0.0, 1.0, 0.0]),
        ])
        .await
        .expect("should upsert");

    let ids = store
        .ids_for_document("doc-1")
        .await
        .expect("should list ids");
    assert_eq!(ids, vec!["chunk-a".to_string(), "chunk-b".to_string()]);
}

#[tokio::test]
async fn delete_document_removes_its_vectors() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[
            record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
            record("chunk-b", "doc-2", vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .await
        .expect("should upsert");

    store
        .delete_document("doc-1")
        .await
        .expect("should delete document vectors");

    assert_eq!(store.count().await.expect("should count"), 1);
    let remaining = store
        .ids_for_document("doc-2")
        .await
        .expect("should list ids");
    assert_eq!(remaining, vec!["chunk-b".to_string()]);
}

#[tokio::test]
async fn delete_removes_one_vector_and_tolerates_missing_ids() {
    let (_dir, store) = create_test_store().await;

    store
        .upsert(&[
            record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0]),
            record("chunk-b", "doc-1", vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .await
        .expect("should upsert");

    store.delete("chunk-a").await.expect("should delete");
    store
        .delete("chunk-a")
        .await
        .expect("repeat delete should be a no-op");
    store
        .delete("never-indexed")
        .await
        .expect("missing id should be a no-op");

    let remaining = store
        .ids_for_document("doc-1")
        .await
        .expect("should list ids");
    assert_eq!(remaining, vec!["chunk-b".to_string()]);
}

#[tokio::test]
async fn reopening_with_different_dimension_fails() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("vectors");

    {
        let _store = VectorStore::new(&path, DIM, DistanceMetric::Cosine, MODEL)
            .await
            .expect("should create vector store");
    }

    let result = VectorStore::new(&path, DIM + 1, DistanceMetric::Cosine, MODEL).await;
    assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
}

#[tokio::test]
async fn model_versions_get_separate_collections() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("vectors");

    let old_model = VectorStore::new(&path, DIM, DistanceMetric::Cosine, MODEL)
        .await
        .expect("should create vector store");
    old_model
        .upsert(&[record("chunk-a", "doc-1", vec![1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("should upsert");

    // A new model version opens an empty collection, even with a different
    // dimension, without disturbing the old one.
    let new_model = VectorStore::new(&path, DIM + 4, DistanceMetric::Cosine, "bge-m4:latest")
        .await
        .expect("should create second collection");

    assert_eq!(new_model.count().await.expect("should count"), 0);
    assert_eq!(old_model.count().await.expect("should count"), 1);
}

#[tokio::test]
async fn empty_store_searches_cleanly() {
    let (_dir, store) = create_test_store().await;

    let matches = store
        .search(&[1.0, 0.0, 0.0, 0.0], 5, None)
        .await
        .expect("should search empty store");
    assert!(matches.is_empty());
}
