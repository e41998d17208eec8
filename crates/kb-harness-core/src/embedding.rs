//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! a deterministic offline [`HashEmbedder`], and helpers for turning raw
//! backend scores into higher-is-better similarities.
//!
//! Network-backed providers (OpenAI, Ollama, fastembed) live in the
//! `kb-harness` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Text → fixed-length vector.
///
/// Implementations must be deterministic for identical input and safe to
/// call concurrently.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Feature-hashing embedder: lowercase alphanumeric tokens are hashed
/// (FNV-1a) into `dims` buckets and the result is L2-normalized.
///
/// Needs no model download or network access, so it is the default
/// provider for local runs and tests. Similarity reflects token overlap.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let bucket = (fnv1a(token.as_bytes()) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Scale `vector` to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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

    dot / denom
}

/// How a backend reports closeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreConvention {
    /// Cosine or dot-product similarity; higher is closer.
    #[default]
    Similarity,
    /// Euclidean (or other) distance; lower is closer.
    Distance,
}

/// Map a raw backend score onto `[0.0, 1.0]`, higher meaning more similar.
///
/// Similarities are clamped (negative cosine means unrelated). Distances
/// go through `1 / (1 + d)`, so `0` maps to `1.0`.
pub fn normalize_score(raw: f32, convention: ScoreConvention) -> f32 {
    if raw.is_nan() {
        return 0.0;
    }
    match convention {
        ScoreConvention::Similarity => raw.clamp(0.0, 1.0),
        ScoreConvention::Distance => 1.0 / (1.0 + raw.max(0.0)),
    }
}
