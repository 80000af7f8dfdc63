#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

/// Integration tests for the LanceDB vector store with realistic data
use ragpipe::config::DistanceMetric;
use ragpipe::database::lancedb::{VectorRecord, VectorStore};
use tempfile::TempDir;

const DIMENSION: usize = 64;
const MODEL: &str = "bge-m3:latest";

async fn create_test_store() -> (TempDir, VectorStore) {
    let dir = TempDir::new().expect("should create temp dir");
    let store = VectorStore::new(dir.path(), DIMENSION, DistanceMetric::Cosine, MODEL)
        .await
        .expect("should create vector store");
    (dir, store)
}

/// Deterministic vector derived from the content, so the same text always
/// lands at the same point and similar variations land nearby.
fn vector_for(content: &str, variation: f32) -> Vec<f32> {
    (0..DIMENSION)
        .map(|i| {
            let base = (i as f32).mul_add(0.01, variation).sin() * 0.1;
            (content.len() as f32).mul_add(0.001, base)
        })
        .collect()
}

fn record(id: &str, document_id: &str, content: &str, variation: f32) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        document_id: document_id.to_string(),
        vector: vector_for(content, variation),
        model_version: "bge-m3:latest".to_string(),
    }
}

fn knowledge_base() -> Vec<VectorRecord> {
    vec![
        record(
            "refund-0",
            "refund-policy",
            "Customers may request a full refund within 30 days of purchase. Refunds are issued to the original payment method.",
            0.10,
        ),
        record(
            "refund-1",
            "refund-policy",
            "Partial refunds apply to annual plans cancelled mid-term, prorated by the number of unused months.",
            0.12,
        ),
        record(
            "shipping-0",
            "shipping-guide",
            "Standard shipping takes five to seven business days. Expedited options are available at checkout.",
            0.40,
        ),
        record(
            "shipping-1",
            "shipping-guide",
            "International orders may incur customs duties collected by the carrier on delivery.",
            0.45,
        ),
        record(
            "warranty-0",
            "warranty-terms",
            "Hardware is covered by a two year limited warranty against manufacturing defects.",
            0.75,
        ),
        record(
            "warranty-1",
            "warranty-terms",
            "Accidental damage is not covered; extended protection plans can be purchased separately.",
            0.80,
        ),
    ]
}

#[tokio::test]
async fn realistic_storage_and_search() {
    let (_dir, store) = create_test_store().await;

    let dataset = knowledge_base();
    store.upsert(&dataset).await.expect("should store vectors");

    let count = store.count().await.expect("should count");
    assert_eq!(count, dataset.len());

    // A query near the refund vectors should rank them first.
    let query = vector_for("How do I get my money back after buying?", 0.11);
    let matches = store
        .search(&query, 3, None)
        .await
        .expect("search should succeed");

    assert_eq!(matches.len(), 3);
    assert!(matches[0].chunk_id.starts_with("refund-"));
    for pair in matches.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn document_filter_restricts_search() {
    let (_dir, store) = create_test_store().await;
    store
        .upsert(&knowledge_base())
        .await
        .expect("should store vectors");

    let query = vector_for("refund", 0.11);
    let matches = store
        .search(&query, 10, Some("shipping-guide"))
        .await
        .expect("search should succeed");

    assert_eq!(matches.len(), 2);
    for hit in &matches {
        assert_eq!(hit.document_id, "shipping-guide");
    }
}

#[tokio::test]
async fn document_deletion_integrity() {
    let (_dir, store) = create_test_store().await;
    let dataset = knowledge_base();
    store.upsert(&dataset).await.expect("should store vectors");

    store
        .delete_document("refund-policy")
        .await
        .expect("should delete");

    let query = vector_for("refund", 0.11);
    let matches = store
        .search(&query, 10, None)
        .await
        .expect("search should succeed");

    assert_eq!(matches.len(), dataset.len() - 2);
    for hit in &matches {
        assert_ne!(hit.document_id, "refund-policy");
    }

    let remaining: Vec<String> = store.document_ids().await.expect("should list documents");
    assert_eq!(remaining, vec!["shipping-guide", "warranty-terms"]);
}

#[tokio::test]
async fn reopened_store_keeps_data() {
    let dir = TempDir::new().expect("should create temp dir");
    let dataset = knowledge_base();

    {
        let store = VectorStore::new(dir.path(), DIMENSION, DistanceMetric::Cosine, MODEL)
            .await
            .expect("should create vector store");
        store.upsert(&dataset).await.expect("should store vectors");
    }

    let reopened = VectorStore::new(dir.path(), DIMENSION, DistanceMetric::Cosine, MODEL)
        .await
        .expect("should reopen vector store");

    let count = reopened.count().await.expect("should count");
    assert_eq!(count, dataset.len());

    let query = vector_for("warranty coverage for defects", 0.76);
    let matches = reopened
        .search(&query, 2, None)
        .await
        .expect("search should succeed");
    assert_eq!(matches.len(), 2);
    assert!(matches[0].chunk_id.starts_with("warranty-"));
}

#[tokio::test]
async fn large_batch_processing() {
    let (_dir, store) = create_test_store().await;

    let mut dataset = Vec::new();
    for i in 0..200 {
        dataset.push(record(
            &format!("chunk-{i:04}"),
            &format!("doc-{}", i % 5),
            &format!("Section {i} describes topic {} in detail with worked examples.", i % 10),
            i as f32 * 0.01,
        ));
    }

    store.upsert(&dataset).await.expect("should store batch");

    let count = store.count().await.expect("should count");
    assert_eq!(count, dataset.len());

    let matches = store
        .search(&dataset[0].vector, 20, None)
        .await
        .expect("search should succeed");
    assert_eq!(matches.len(), 20);
    assert_eq!(matches[0].chunk_id, "chunk-0000");

    // Re-running the same upsert must not duplicate rows.
    store.upsert(&dataset).await.expect("should upsert again");
    let count = store.count().await.expect("should count again");
    assert_eq!(count, dataset.len());
}
