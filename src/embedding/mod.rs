//! Embedding backends.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`LocalEmbedder`]** runs a multilingual sentence-embedding model
//!   in-process via fastembed. The model is downloaded once, then works offline.
//! - **[`OpenAiEmbedder`]** calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`DisabledEmbedder`]** fails every call with
//!   [`EmbedError::ModelUnavailable`].
//!
//! Also provides the vector utilities used by the knowledge store:
//! [`cosine_similarity`], [`vec_to_blob`] and [`blob_to_vec`].
//!
//! # Retry Strategy
//!
//! The HTTP backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::models::FailureKind;

/// Model used by the `local` provider when none is configured.
pub const DEFAULT_LOCAL_MODEL: &str = "paraphrase-multilingual-minilm-l12-v2";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
    #[error("embedding backend returned a {got}-dimensional vector, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbedError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EmbedError::DimensionMismatch { .. } => FailureKind::IncompatibleModel,
            _ => FailureKind::ModelUnavailable,
        }
    }
}

/// A text embedding backend.
///
/// Implementations must be deterministic for a fixed model version and
/// return exactly one `dims()`-length vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in the knowledge store.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.pop() {
            Some(v) if vectors.is_empty() => Ok(v),
            _ => Err(EmbedError::CountMismatch {
                expected: 1,
                got: vectors.len() + 1,
            }),
        }
    }
}

/// Check a backend's output against the request before anything is stored.
pub fn check_vectors(
    expected_count: usize,
    dims: usize,
    vectors: &[Vec<f32>],
) -> Result<(), EmbedError> {
    if vectors.len() != expected_count {
        return Err(EmbedError::CountMismatch {
            expected: expected_count,
            got: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbedError::DimensionMismatch {
            expected: dims,
            got: bad.len(),
        });
    }
    Ok(())
}

// ============ Disabled ============

/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::ModelUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP backends ============

/// POST `body` to `url`, retrying transient failures with exponential backoff.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value, EmbedError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(backend = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        EmbedError::ModelUnavailable(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(backend = label, %status, "transient embedding API error");
                    last_err = Some(format!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                return Err(EmbedError::ModelUnavailable(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                )));
            }
            Err(e) => {
                warn!(backend = label, error = %e, "embedding request failed");
                last_err = Some(format!("{} connection error ({}): {}", label, url, e));
            }
        }
    }

    Err(EmbedError::ModelUnavailable(last_err.unwrap_or_else(|| {
        format!("{} embedding failed after retries", label)
    })))
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, EmbedError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| EmbedError::ModelUnavailable(format!("HTTP client: {}", e)))
}

fn required_model_and_dims(
    config: &EmbeddingConfig,
    label: &str,
) -> Result<(String, usize), EmbedError> {
    let model = config.model.clone().ok_or_else(|| {
        EmbedError::ModelUnavailable(format!("embedding.model required for {} provider", label))
    })?;
    let dims = config.dims.ok_or_else(|| {
        EmbedError::ModelUnavailable(format!("embedding.dims required for {} provider", label))
    })?;
    Ok((model, dims))
}

/// OpenAI `POST /v1/embeddings`. Reads the key from `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let (model, dims) = required_model_and_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            EmbedError::ModelUnavailable("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_with_retry(
                &self.client,
                "https://api.openai.com/v1/embeddings",
                Some(&self.api_key),
                &body,
                self.max_retries,
                "OpenAI",
            )
            .await?;
            let vectors = parse_openai_response(&json)?;
            check_vectors(batch.len(), self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let malformed = |what: &str| {
        EmbedError::ModelUnavailable(format!("invalid OpenAI response: {}", what))
    };
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| malformed("missing embedding"))?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Ollama `POST /api/embed` (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let (model, dims) = required_model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            url: url.trim_end_matches('/').to_string(),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let endpoint = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_with_retry(
                &self.client,
                &endpoint,
                None,
                &body,
                self.max_retries,
                "Ollama",
            )
            .await?;
            let vectors = parse_ollama_response(&json)?;
            check_vectors(batch.len(), self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let malformed = |what: &str| {
        EmbedError::ModelUnavailable(format!("invalid Ollama response: {}", what))
    };
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("missing embeddings array"))?
        .iter()
        .map(|e| parse_vector(e).ok_or_else(|| malformed("embedding is not a number array")))
        .collect()
}

// ============ Local (fastembed) ============

/// Known local models and their output width.
#[cfg_attr(not(feature = "local-embeddings-fastembed"), allow(dead_code))]
fn local_model_dims(name: &str) -> Option<usize> {
    match name {
        "paraphrase-multilingual-minilm-l12-v2" => Some(384),
        "paraphrase-multilingual-mpnet-base-v2" => Some(768),
        "multilingual-e5-small" => Some(384),
        "multilingual-e5-base" => Some(768),
        "multilingual-e5-large" => Some(1024),
        "all-minilm-l6-v2" => Some(384),
        "bge-small-zh-v1.5" => Some(512),
        _ => None,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel, EmbedError> {
    use fastembed::EmbeddingModel;
    match name {
        "paraphrase-multilingual-minilm-l12-v2" => Ok(EmbeddingModel::ParaphraseMLMiniLML12V2),
        "paraphrase-multilingual-mpnet-base-v2" => Ok(EmbeddingModel::ParaphraseMLMpnetBaseV2),
        "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(EmbeddingModel::MultilingualE5Large),
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-zh-v1.5" => Ok(EmbeddingModel::BGESmallZHV15),
        other => Err(EmbedError::ModelUnavailable(format!(
            "unknown local embedding model '{}'",
            other
        ))),
    }
}

/// In-process embedding via fastembed (ONNX runtime bundled).
///
/// The model is loaded lazily on the first call and cached for the life of
/// the embedder; inference runs on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Arc<parking_lot::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        to_fastembed_model(&model_name)?;
        let known = local_model_dims(&model_name).unwrap_or(384);
        let dims = config.dims.unwrap_or(known);
        if dims != known {
            return Err(EmbedError::DimensionMismatch {
                expected: dims,
                got: known,
            });
        }

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            model: std::sync::Arc::new(parking_lot::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let cell = self.model.clone();
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let inputs = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = cell.lock();
            if guard.is_none() {
                debug!(model = %name, "loading local embedding model");
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(to_fastembed_model(&name)?)
                        .with_show_download_progress(false),
                )
                .map_err(|e| {
                    EmbedError::ModelUnavailable(format!("failed to load {}: {}", name, e))
                })?;
                *guard = Some(loaded);
            }
            match guard.as_mut() {
                Some(model) => model.embed(inputs, Some(batch_size)).map_err(|e| {
                    EmbedError::ModelUnavailable(format!("local embedding failed: {}", e))
                }),
                None => Err(EmbedError::ModelUnavailable(name)),
            }
        })
        .await
        .map_err(|e| EmbedError::ModelUnavailable(format!("embedding task failed: {}", e)))??;

        check_vectors(texts.len(), self.dims, &vectors)?;
        Ok(vectors)
    }
}

/// Build the configured embedder.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"local"` | [`LocalEmbedder`] (feature `local-embeddings-fastembed`) |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(
    config: &EmbeddingConfig,
) -> Result<std::sync::Arc<dyn Embedder>, EmbedError> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledEmbedder)),
        "openai" => Ok(std::sync::Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(std::sync::Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(std::sync::Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(EmbedError::ModelUnavailable(
            "local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(EmbedError::ModelUnavailable(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a float vector as little-endian f32 bytes (`len × 4` bytes).
///
/// ```rust
/// use kylin_assist::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not form a whole
/// `f32` are ignored; callers check the length against the store width.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_check_vectors() {
        let ok = vec![vec![0.0; 3], vec![1.0; 3]];
        assert!(check_vectors(2, 3, &ok).is_ok());
        assert!(matches!(
            check_vectors(3, 3, &ok),
            Err(EmbedError::CountMismatch { expected: 3, got: 2 })
        ));
        let err = check_vectors(2, 4, &ok).unwrap_err();
        assert_eq!(err.kind(), FailureKind::IncompatibleModel);
    }

    #[tokio::test]
    async fn test_disabled_embedder_is_unavailable() {
        let err = DisabledEmbedder.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ModelUnavailable);
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.5], [1.0, 0.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);

        let bad = serde_json::json!({ "embeddings": [["x"]] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_create_embedder_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "magic".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());

        let disabled = EmbeddingConfig {
            provider: "disabled".to_string(),
            ..EmbeddingConfig::default()
        };
        assert_eq!(create_embedder(&disabled).unwrap().model_name(), "disabled");
    }

    #[test]
    fn test_known_local_dims() {
        assert_eq!(local_model_dims(DEFAULT_LOCAL_MODEL), Some(384));
        assert_eq!(local_model_dims("unknown"), None);
    }
}
