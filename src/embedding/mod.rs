//! Embedding providers behind the core [`Embedder`] trait.
//!
//! - **hash**: [`HashEmbedder`] from the core crate. Deterministic and
//!   offline; useful for local runs and tests.
//! - **openai**: [`OpenAIEmbedder`] calls `POST /v1/embeddings`.
//! - **ollama**: [`OllamaEmbedder`] calls `POST /api/embed` on a local
//!   Ollama instance.
//! - **local**: `LocalEmbedder` runs fastembed in-process (requires the
//!   `local-embeddings-fastembed` feature).
//!
//! Use [`create_embedder`] to pick one from configuration.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Each attempt is bounded by `timeout_secs` through the HTTP client.
//! [`call_budget`] is the longest a single `embed` call can take with every
//! retry spent, and is the deadline the build pipeline applies per passage.

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;

use anyhow::{bail, Result};
use async_trait::async_trait;
use kb_harness_core::embedding::{Embedder, HashEmbedder};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Dimensionality of the hash provider when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 384;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Build the embedder named by `config.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (fastembed feature) |
///
/// # Errors
///
/// Unknown provider names, missing model/dims, a missing
/// `OPENAI_API_KEY`, or `"local"` without the fastembed feature.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn required_model(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Worst-case duration of one `embed` call: every attempt hitting the
/// client timeout plus the backoff between attempts.
pub fn call_budget(config: &EmbeddingConfig) -> Duration {
    let per_attempt = Duration::from_secs(config.timeout_secs);
    let attempts = config.max_retries + 1;
    (1..=config.max_retries).fold(per_attempt * attempts, |total, attempt| {
        total + backoff(attempt)
    })
}

fn first_embedding(mut vectors: Vec<Vec<f32>>, dims: usize) -> Result<Vec<f32>> {
    if vectors.is_empty() {
        bail!("Empty embedding response");
    }
    let vector = vectors.swap_remove(0);
    if vector.len() != dims {
        bail!(
            "Embedding has {} dimensions, expected {}",
            vector.len(),
            dims
        );
    }
    Ok(vector)
}

fn to_core_error(err: anyhow::Error) -> kb_harness_core::Error {
    kb_harness_core::Error::EmbeddingFailure(format!("{:#}", err))
}

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let resp = self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "OpenAI embedding request will be retried");
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> kb_harness_core::Result<Vec<f32>> {
        self.embed_texts(&[text])
            .await
            .and_then(|vectors| first_embedding(vectors, self.dims))
            .map_err(to_core_error)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push((index, vec));
    }

    embeddings.sort_by_key(|(index, _)| *index);
    Ok(embeddings.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). The model must already be pulled.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_ollama_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "Ollama API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")))
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

    async fn embed(&self, text: &str) -> kb_harness_core::Result<Vec<f32>> {
        self.embed_texts(&[text])
            .await
            .and_then(|vectors| first_embedding(vectors, self.dims))
            .map_err(to_core_error)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}
