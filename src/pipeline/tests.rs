use std::path::Path;

use serde_json::json;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::*;
use crate::config::{DistanceMetric, LimitsConfig, OllamaConfig, RetrievalConfig};

/// Answers `/api/embed` with one deterministic vector per input text, so
/// identical texts always embed identically.
struct EmbedResponder;

impl Respond for EmbedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value =
            serde_json::from_slice(&request.body).expect("request body should be json");
        let inputs = body["input"].as_array().expect("input should be an array");
        let embeddings: Vec<Vec<f32>> = inputs
            .iter()
            .map(|text| vector_for(text.as_str().unwrap_or("")))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
    }
}

fn vector_for(text: &str) -> Vec<f32> {
    let mut hash = 0u32;
    for byte in text.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    (0..4)
        .map(|i| ((hash >> (i * 8)) & 0xFF) as f32 / 255.0 + 0.01)
        .collect()
}

fn test_config(base_dir: &Path, server: &MockServer) -> Config {
    let uri = Url::parse(&server.uri()).expect("mock server uri should parse");
    Config {
        ollama: OllamaConfig {
            protocol: "http".to_string(),
            host: uri.host_str().expect("should have host").to_string(),
            port: uri.port().expect("should have port"),
            model: "test-model".to_string(),
            batch_size: 50,
            embedding_dimension: 4,
        },
        chunking: crate::chunker::ChunkingConfig {
            target_size: 200,
            min_size: 50,
            overlap: 20,
        },
        retrieval: RetrievalConfig {
            metric: DistanceMetric::Cosine,
            default_k: 5,
            cache_ttl_seconds: 300,
            cache_capacity: 16,
        },
        limits: LimitsConfig {
            max_document_bytes: 1024 * 1024,
        },
        base_dir: base_dir.to_path_buf(),
    }
}

async fn mount_embeddings(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(EmbedResponder)
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn test_pipeline(server: &MockServer) -> (TempDir, Pipeline) {
    let dir = TempDir::new().expect("should create temp dir");
    let pipeline = Pipeline::new(test_config(dir.path(), server))
        .await
        .expect("should build pipeline");
    (dir, pipeline)
}

fn sample_text() -> String {
    let mut text = String::new();
    for i in 0..8 {
        text.push_str(&format!(
            "Paragraph {i} explains the refund policy in enough detail to fill a chunk. "
        ));
        text.push_str("\n\n");
    }
    text
}

#[tokio::test]
async fn ingestion_reaches_ready_with_vectors() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 1).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");

    let IngestOutcome::Ingested {
        document,
        chunk_count,
    } = outcome
    else {
        panic!("expected Ingested outcome");
    };
    assert!(document.is_ready());
    assert_eq!(document.model_version.as_deref(), Some("test-model"));
    assert_eq!(document.media_type, "text/plain");
    assert!(chunk_count >= 2);

    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, chunk_count);

    let summaries = pipeline.list_documents().await.expect("should list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].chunk_count, chunk_count as i64);
    assert_eq!(summaries[0].embedded_count, chunk_count as i64);
}

#[tokio::test]
async fn reingesting_identical_content_short_circuits() {
    let server = MockServer::start().await;
    // One embedding call total: the second ingest must not embed.
    mount_embeddings(&server, 1).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let text = sample_text();
    let first = pipeline
        .ingest("policy.txt", text.as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested { document, .. } = first else {
        panic!("expected Ingested outcome");
    };

    let second = pipeline
        .ingest("policy.txt", text.as_bytes(), Some("text/plain"))
        .await
        .expect("should short-circuit");
    let IngestOutcome::Unchanged { document: same } = second else {
        panic!("expected Unchanged outcome");
    };
    assert_eq!(same.id, document.id);
}

#[tokio::test]
async fn changed_content_replaces_document() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 2).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let first = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested { document: old, .. } = first else {
        panic!("expected Ingested outcome");
    };

    let revised = format!("{}\n\nA brand new closing paragraph.", sample_text());
    let second = pipeline
        .ingest("policy.txt", revised.as_bytes(), Some("text/plain"))
        .await
        .expect("should re-ingest");
    let IngestOutcome::Ingested {
        document: new,
        chunk_count,
    } = second
    else {
        panic!("expected Ingested outcome");
    };

    assert_ne!(old.id, new.id);

    let summaries = pipeline.list_documents().await.expect("should list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].document.id, new.id);

    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, chunk_count);
}

#[tokio::test]
async fn embedding_failure_marks_document_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let result = pipeline
        .ingest("doomed.txt", sample_text().as_bytes(), Some("text/plain"))
        .await;
    assert!(matches!(result, Err(RagError::ProviderUnavailable(_))));

    let document = pipeline
        .database()
        .get_document_by_source("doomed.txt")
        .await
        .expect("should query")
        .expect("document record should exist");
    assert!(document.is_failed());
    assert!(document.error_message.is_some());

    // Chunks survive for re-embedding repair, but no vectors do.
    let chunks = pipeline
        .database()
        .chunks_for_document(&document.id)
        .await
        .expect("should list chunks");
    assert!(!chunks.is_empty());
    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, 0);
}

#[tokio::test]
async fn unreadable_document_leaves_failed_record() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 0).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    // Not a ZIP, not OLE2, not HTML, and not valid UTF-8.
    let result = pipeline
        .ingest("broken.bin", &[0x00, 0xFF, 0xFE, 0x01, 0x80], None)
        .await;
    assert!(matches!(result, Err(RagError::UnsupportedFormat(_))));

    let document = pipeline
        .database()
        .get_document_by_source("broken.bin")
        .await
        .expect("should query")
        .expect("failed ingestion should still leave a record");
    assert!(document.is_failed());
    assert!(
        document
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("Unsupported document format")
    );

    let summaries = pipeline.list_documents().await.expect("should list");
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].document.is_failed());
}

#[tokio::test]
async fn blank_document_is_skipped() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 0).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("empty.txt", b"   \n\n   ", Some("text/plain"))
        .await
        .expect("should skip");
    assert_eq!(outcome, IngestOutcome::SkippedEmpty);

    let summaries = pipeline.list_documents().await.expect("should list");
    assert!(summaries.is_empty());
}

#[tokio::test]
async fn query_returns_ranked_context_and_caches() {
    let server = MockServer::start().await;
    // One call for ingestion, one for the first query; the repeat query is
    // served from cache.
    mount_embeddings(&server, 2).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");

    let first = pipeline
        .query("refund policy", Some(3), None)
        .await
        .expect("should query");
    assert!(!first.cached);
    assert!(!first.chunks.is_empty());
    assert!(first.chunks.len() <= 3);
    for chunk in &first.chunks {
        assert_eq!(chunk.source_name, "policy.txt");
    }
    for pair in first.chunks.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let second = pipeline
        .query("refund policy", Some(3), None)
        .await
        .expect("should query again");
    assert!(second.cached);
    assert_eq!(second.chunks, first.chunks);

    // Whitespace variations of the same query hit the same cache entry.
    let respaced = pipeline
        .query("  refund \t policy ", Some(3), None)
        .await
        .expect("should query respaced");
    assert!(respaced.cached);
    assert_eq!(respaced.chunks, first.chunks);
}

#[tokio::test]
async fn query_input_is_validated() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 0).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    assert!(matches!(
        pipeline.query("   ", None, None).await,
        Err(RagError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.query("valid", Some(0), None).await,
        Err(RagError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn delete_removes_document_chunks_and_vectors() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 3).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");

    // Warm the cache, then make sure deletion invalidates it.
    let warm = pipeline
        .query("refund policy", Some(3), None)
        .await
        .expect("should query");
    assert!(!warm.chunks.is_empty());

    pipeline.delete("policy.txt").await.expect("should delete");

    let summaries = pipeline.list_documents().await.expect("should list");
    assert!(summaries.is_empty());
    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, 0);

    let after = pipeline
        .query("refund policy", Some(3), None)
        .await
        .expect("should query after delete");
    assert!(!after.cached);
    assert!(after.chunks.is_empty());

    assert!(matches!(
        pipeline.delete("policy.txt").await,
        Err(RagError::NotFound(_))
    ));
}

#[tokio::test]
async fn reconcile_flags_stuck_document_and_rollback_repairs() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 1).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested { document, .. } = outcome else {
        panic!("expected Ingested outcome");
    };

    // Simulate a crash mid-ingestion: vectors written, status never advanced.
    pipeline
        .database()
        .set_document_status(&document.id, DocumentStatus::Embedding)
        .await
        .expect("should rewind status");

    let report = pipeline.reconcile().await.expect("should reconcile");
    assert!(!report.is_consistent());
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.drifted[0].kind, DriftKind::StuckInFlight);
    assert_eq!(report.drifted[0].document_id, document.id);

    pipeline
        .repair(&report, RepairMode::Rollback)
        .await
        .expect("should repair");

    let repaired = pipeline
        .database()
        .get_document(&document.id)
        .await
        .expect("should fetch")
        .expect("document should exist");
    assert!(repaired.is_failed());
    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, 0);

    let after = pipeline.reconcile().await.expect("should reconcile again");
    assert!(after.is_consistent());
}

#[tokio::test]
async fn reconcile_reembed_restores_ready() {
    let server = MockServer::start().await;
    // Ingest once, then one more embedding call during re-embed repair.
    mount_embeddings(&server, 2).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested {
        document,
        chunk_count,
    } = outcome
    else {
        panic!("expected Ingested outcome");
    };

    // Simulate a crash where no vectors survived.
    pipeline
        .database()
        .set_document_status(&document.id, DocumentStatus::Embedding)
        .await
        .expect("should rewind status");
    pipeline
        .vector_store()
        .delete_document(&document.id)
        .await
        .expect("should drop vectors");

    let report = pipeline.reconcile().await.expect("should reconcile");
    assert!(!report.is_consistent());

    pipeline
        .repair(&report, RepairMode::Reembed)
        .await
        .expect("should repair");

    let repaired = pipeline
        .database()
        .get_document(&document.id)
        .await
        .expect("should fetch")
        .expect("document should exist");
    assert!(repaired.is_ready());
    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, chunk_count);

    let after = pipeline.reconcile().await.expect("should reconcile again");
    assert!(after.is_consistent());
}

#[tokio::test]
async fn cancel_settles_in_flight_document() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 1).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested { document, .. } = outcome else {
        panic!("expected Ingested outcome");
    };

    // A Ready document is not cancellable.
    assert!(matches!(
        pipeline.cancel(&document.id).await,
        Err(RagError::InvalidInput(_))
    ));

    pipeline
        .database()
        .set_document_status(&document.id, DocumentStatus::Embedding)
        .await
        .expect("should rewind status");

    let cancelled = pipeline.cancel(&document.id).await.expect("should cancel");
    assert!(cancelled.is_failed());

    let vectors = pipeline
        .vector_store()
        .count()
        .await
        .expect("should count vectors");
    assert_eq!(vectors, 0);

    let report = pipeline.reconcile().await.expect("should reconcile");
    assert!(report.is_consistent());
}

#[tokio::test]
async fn reconcile_detects_missing_vectors_for_ready_document() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 1).await;
    let (_dir, pipeline) = test_pipeline(&server).await;

    let outcome = pipeline
        .ingest("policy.txt", sample_text().as_bytes(), Some("text/plain"))
        .await
        .expect("should ingest");
    let IngestOutcome::Ingested { document, .. } = outcome else {
        panic!("expected Ingested outcome");
    };

    pipeline
        .vector_store()
        .delete_document(&document.id)
        .await
        .expect("should drop vectors");

    let report = pipeline.reconcile().await.expect("should reconcile");
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.drifted[0].kind, DriftKind::MissingVectors);
    assert!(!report.drifted[0].missing_vector_ids.is_empty());
}
