//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete backends:
//!
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed`
//!   endpoint with retry and exponential backoff.
//! - **[`HashEmbedder`]** — deterministic offline provider that folds word
//!   and character-trigram features into a fixed-dimension vector. No
//!   network, no model files; the same text always produces the same
//!   vector, which is what the test suite and air-gapped setups need.
//!
//! [`embed_in_batches`] is the ingestion-side batch runner: it fans batches
//! out with bounded parallelism and reassembles results by batch index, with
//! every element carrying its chunk id, so chunk-to-vector assignment never
//! depends on completion order.
//!
//! # Retry Strategy (Ollama)
//!
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EmbeddingConfig;
use crate::models::Chunk;

/// Embedding failure. Fatal to the ingestion of the document whose batch
/// failed; the engine records it in the per-document report.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Response(String),
    #[error("expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },
    #[error("embedding dimension changed mid-run: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding task failed: {0}")]
    Task(String),
}

/// A stateless mapping from text to fixed-length vectors. Pure with respect
/// to (text, model): identical input must yield identical output.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in the index header.
    fn model(&self) -> &str;
    /// Dimension hint; 0 means unknown until the first response.
    fn dimensions(&self) -> usize;
    /// Embed one batch, one vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Instantiate the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimensions))),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, EmbedError> {
    let mut vectors = provider.embed(&[text.to_string()]).await?;
    if vectors.len() != 1 {
        return Err(EmbedError::CountMismatch {
            expected: 1,
            got: vectors.len(),
        });
    }
    Ok(vectors.remove(0))
}

/// Embed all chunks in `batch_size` batches with up to `concurrency` batches
/// in flight. Returns `(chunk_id, vector)` pairs in the original chunk
/// order; all vectors are checked for a uniform dimension.
pub async fn embed_in_batches(
    provider: Arc<dyn EmbeddingProvider>,
    chunks: &[Chunk],
    batch_size: usize,
    concurrency: usize,
) -> Result<Vec<(String, Vec<f32>)>, EmbedError> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let batches: Vec<Vec<(String, String)>> = chunks
        .chunks(batch_size.max(1))
        .map(|b| b.iter().map(|c| (c.id.clone(), c.text.clone())).collect())
        .collect();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let mut set = JoinSet::new();
    for (batch_idx, items) in batches.into_iter().enumerate() {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| EmbedError::Task(e.to_string()))?;
            let texts: Vec<String> = items.iter().map(|(_, t)| t.clone()).collect();
            let vectors = provider.embed(&texts).await?;
            if vectors.len() != items.len() {
                return Err(EmbedError::CountMismatch {
                    expected: items.len(),
                    got: vectors.len(),
                });
            }
            let paired: Vec<(String, Vec<f32>)> = items
                .into_iter()
                .zip(vectors)
                .map(|((id, _), v)| (id, v))
                .collect();
            Ok((batch_idx, paired))
        });
    }

    let mut slots: Vec<Option<Vec<(String, Vec<f32>)>>> = Vec::new();
    slots.resize_with(chunks.len().div_ceil(batch_size.max(1)), || None);
    while let Some(joined) = set.join_next().await {
        let (batch_idx, paired) = joined.map_err(|e| EmbedError::Task(e.to_string()))??;
        slots[batch_idx] = Some(paired);
    }

    let mut out = Vec::with_capacity(chunks.len());
    for slot in slots {
        out.extend(slot.unwrap_or_default());
    }

    let mut dims = 0usize;
    for (_, vector) in &out {
        if dims == 0 {
            dims = vector.len();
        } else if vector.len() != dims {
            return Err(EmbedError::DimensionMismatch {
                expected: dims,
                got: vector.len(),
            });
        }
    }
    Ok(out)
}

// ============ Ollama ============

/// Embedding provider backed by a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL. Requires an embedding
/// model to be pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.base_url))
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embed_response(&json);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EmbedError::Api {
                            status: status.as_u16(),
                            body: body_text,
                        });
                        continue;
                    }
                    return Err(EmbedError::Api {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                Err(e) => {
                    last_err = Some(EmbedError::Http(e));
                    continue;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| EmbedError::Response("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let vectors = self.send_with_retry(&body).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::Response("missing embeddings array".to_string()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| EmbedError::Response("embedding is not an array".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

// ============ Hash ============

/// Deterministic offline embedder. Words and their character trigrams are
/// hashed into signed buckets and the result is L2-normalized, so texts
/// sharing vocabulary land near each other. Not a semantic model; a cheap,
/// reproducible stand-in where Ollama is unavailable.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: if dims == 0 { 384 } else { dims },
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model(&self) -> &str {
        "hash"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
    }
}

/// Fold one text into a unit vector of `dims` buckets.
pub fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        bump(&mut v, &word);
        let chars: Vec<char> = word.chars().collect();
        for tri in chars.windows(3) {
            let tri: String = tri.iter().collect();
            bump(&mut v, &tri);
        }
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn bump(v: &mut [f32], token: &str) {
    let digest = Sha256::digest(token.as_bytes());
    let idx = u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]) as usize
        % v.len();
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    v[idx] += sign;
}
