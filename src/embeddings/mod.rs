
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::OllamaConfig;
use crate::{RagError, Result};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const QUERY_TIMEOUT_SECONDS: u64 = 10;

/// Retry behavior for embedding calls. Only transient provider failures
/// (server errors, rate limits, transport faults) are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Fraction of each delay added as jitter (0.0 to 1.0) so concurrent
    /// workers do not retry in lockstep.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping between attempts.
    #[inline]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    fn delay_before(&self, next_attempt: u32) -> Duration {
        // Exponential backoff: base, 2x base, 4x base, ...
        let backoff = self.base_delay * 2u32.saturating_pow(next_attempt.saturating_sub(2));
        if self.jitter <= 0.0 {
            return backoff;
        }

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.subsec_nanos());
        backoff.mul_f64(1.0 + self.jitter * f64::from(nanos % 1000) / 1000.0)
    }
}

/// Client for the Ollama embeddings API.
///
/// Both document chunks and query strings go through the same `/api/embed`
/// endpoint; chunk batches are split to the configured batch size and the
/// response order mirrors the request order.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    base_url: Url,
    model: String,
    batch_size: usize,
    dimension: usize,
    agent: ureq::Agent,
    query_agent: ureq::Agent,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| RagError::InvalidInput(format!("invalid embedding provider URL: {e}")))?;

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size as usize,
            dimension: config.embedding_dimension as usize,
            agent: agent_with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            query_agent: agent_with_timeout(Duration::from_secs(QUERY_TIMEOUT_SECONDS)),
            retry: RetryPolicy::default(),
        })
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = agent_with_timeout(timeout);
        self.query_agent = agent_with_timeout(timeout);
        self
    }

    /// The model tag stamped onto every vector produced by this client.
    #[inline]
    pub fn model_version(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Check that the provider is reachable and serves the configured model.
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        let url = self.endpoint("/api/tags")?;
        let body = self.request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let models: ModelsResponse = serde_json::from_str(&body).map_err(|e| {
            RagError::ProviderUnavailable(format!("malformed model list response: {e}"))
        })?;

        if models.models.iter().any(|m| m.name == self.model) {
            debug!("Embedding model {} is available", self.model);
            Ok(())
        } else {
            let available: Vec<&str> = models.models.iter().map(|m| m.name.as_str()).collect();
            Err(RagError::ProviderUnavailable(format!(
                "model '{}' is not available (found: {:?})",
                self.model, available
            )))
        }
    }

    /// Embed chunk texts, preserving input order. The result has exactly one
    /// vector per input text, each of the configured dimension.
    #[inline]
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Embedding {} texts in batches of {}",
            texts.len(),
            self.batch_size
        );

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_single_batch(batch, &self.agent)?);
        }

        Ok(vectors)
    }

    /// Embed one query string under a tighter timeout than bulk ingestion.
    #[inline]
    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput(
                "query text must not be blank".to_string(),
            ));
        }

        let input = [text.to_string()];
        let mut vectors = self.embed_single_batch(&input, &self.query_agent)?;
        // embed_single_batch guarantees exactly one vector per input.
        vectors
            .pop()
            .ok_or_else(|| RagError::ProviderUnavailable("empty embedding response".to_string()))
    }

    fn embed_single_batch(&self, texts: &[String], agent: &ureq::Agent) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/api/embed")?;
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| RagError::InvalidInput(format!("unserializable embed request: {e}")))?;

        let body = self.request_with_retry(|| {
            agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: EmbedResponse = serde_json::from_str(&body).map_err(|e| {
            RagError::ProviderUnavailable(format!("malformed embedding response: {e}"))
        })?;

        if response.embeddings.len() != texts.len() {
            return Err(RagError::ProviderUnavailable(format!(
                "embedding count mismatch: sent {} texts, received {} vectors",
                texts.len(),
                response.embeddings.len()
            )));
        }

        for vector in &response.embeddings {
            if vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    got: vector.len(),
                    expected: self.dimension,
                });
            }
        }

        Ok(response.embeddings)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RagError::InvalidInput(format!("invalid endpoint {path}: {e}")))
    }

    fn request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            match request_fn() {
                Ok(body) => return Ok(body),
                Err(error) => {
                    let classified = classify_transport_error(error);
                    if !classified.is_retryable() {
                        return Err(classified);
                    }

                    warn!(
                        "Embedding request failed (attempt {}/{}): {}",
                        attempt, self.retry.max_attempts, classified
                    );
                    last_error = Some(classified);

                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_before(attempt + 1);
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RagError::ProviderUnavailable("embedding request failed".to_string())
        }))
    }
}

fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// Map an HTTP-level failure onto the provider error taxonomy. 429 is a
/// rate limit, other 4xx are caller mistakes, everything else means the
/// provider is unavailable.
fn classify_transport_error(error: ureq::Error) -> RagError {
    match error {
        ureq::Error::StatusCode(429) => {
            RagError::RateLimited("embedding provider returned HTTP 429".to_string())
        }
        ureq::Error::StatusCode(status) if status >= 500 => {
            RagError::ProviderUnavailable(format!("embedding provider returned HTTP {status}"))
        }
        ureq::Error::StatusCode(status) => {
            RagError::InvalidInput(format!("embedding provider rejected request: HTTP {status}"))
        }
        other => RagError::ProviderUnavailable(format!("embedding provider unreachable: {other}")),
    }
}
