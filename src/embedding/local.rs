//! In-process embeddings via fastembed.
//!
//! The model is downloaded from Hugging Face on first use and cached;
//! after that no network calls are made. Inference runs in
//! `spawn_blocking` so it never stalls the async runtime.

use anyhow::{bail, Result};
use async_trait::async_trait;
use kb_harness_core::embedding::Embedder;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::EmbeddingConfig;

const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    kind: fastembed::EmbeddingModel,
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        let (kind, default_dims) = fastembed_model(&model_name)?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            kind,
            model: Arc::new(Mutex::new(None)),
        })
    }
}

fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    match name {
        "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((fastembed::EmbeddingModel::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((fastembed::EmbeddingModel::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ),
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> kb_harness_core::Result<Vec<f32>> {
        let slot = Arc::clone(&self.model);
        let kind = self.kind.clone();
        let text = text.to_string();

        let outcome = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(kind).with_show_download_progress(false),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local embedding model unavailable"))?;
            model
                .embed(vec![text], None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await
        .map_err(|e| kb_harness_core::Error::EmbeddingFailure(e.to_string()))?;

        outcome
            .and_then(|vectors| super::first_embedding(vectors, self.dims))
            .map_err(super::to_core_error)
    }
}
