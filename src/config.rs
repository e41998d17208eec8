//! TOML configuration parsing and validation.
//!
//! Every section except `[knowledge]` is optional and falls back to the
//! defaults below. Secrets are never read from the file: the Pinecone and
//! OpenAI keys come from `PINECONE_API_KEY` and `OPENAI_API_KEY`.
//!
//! ```toml
//! [knowledge]
//! dir = "./docs"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [retrieval]
//! faq_threshold = 0.85
//! general_threshold = 0.45
//!
//! [embedding]
//! provider = "hash"
//! max_concurrency = 2
//!
//! [index]
//! backend = "memory"
//! namespace = "eco-chatbot"
//!
//! [server]
//! bind = "127.0.0.1:5000"
//! ```

use anyhow::{bail, Context, Result};
use kb_harness_core::embedding::ScoreConvention;
use kb_harness_core::retrieve::RetrievalParams;
use kb_harness_core::segment::{TextSplitter, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Defaults everywhere, knowledge base at `./docs`.
    pub fn minimal() -> Self {
        Self::for_dir("./docs")
    }

    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            knowledge: KnowledgeConfig {
                dir: dir.into(),
                extension: default_extension(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.knowledge.extension.trim().is_empty() {
            bail!("knowledge.extension must not be empty");
        }

        self.chunking
            .splitter()
            .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

        let r = &self.retrieval;
        for (name, value) in [
            ("faq_threshold", r.faq_threshold),
            ("general_threshold", r.general_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("retrieval.{} must be in [0.0, 1.0]", name);
            }
        }
        for (name, value) in [
            ("faq_top_k", r.faq_top_k),
            ("general_top_k", r.general_top_k),
            ("general_max_results", r.general_max_results),
        ] {
            if value < 1 {
                bail!("retrieval.{} must be >= 1", name);
            }
        }

        if self.embedding.max_concurrency < 1 {
            bail!("embedding.max_concurrency must be >= 1");
        }
        if self.embedding.timeout_secs < 1 {
            bail!("embedding.timeout_secs must be >= 1");
        }
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "ollama" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama") {
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.index.backend.as_str() {
            "memory" | "pinecone" => {}
            other => bail!(
                "Unknown index backend: '{}'. Must be memory or pinecone.",
                other
            ),
        }
        if self.index.namespace.trim().is_empty() {
            bail!("index.namespace must not be empty");
        }
        if self.index.upsert_batch_size < 1 {
            bail!("index.upsert_batch_size must be >= 1");
        }
        self.index.score_convention()?;

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// Directory holding the markdown knowledge base.
    pub dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "md".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn splitter(&self) -> kb_harness_core::Result<TextSplitter> {
        TextSplitter::new(self.chunk_size, self.chunk_overlap)
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_faq_threshold")]
    pub faq_threshold: f32,
    #[serde(default = "default_faq_top_k")]
    pub faq_top_k: usize,
    #[serde(default = "default_general_threshold")]
    pub general_threshold: f32,
    #[serde(default = "default_general_top_k")]
    pub general_top_k: usize,
    #[serde(default = "default_general_max_results")]
    pub general_max_results: usize,
    #[serde(default = "default_support_email")]
    pub support_email: String,
    /// Overrides the generated fallback message entirely.
    #[serde(default)]
    pub fallback_text: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            faq_threshold: default_faq_threshold(),
            faq_top_k: default_faq_top_k(),
            general_threshold: default_general_threshold(),
            general_top_k: default_general_top_k(),
            general_max_results: default_general_max_results(),
            support_email: default_support_email(),
            fallback_text: None,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        let fallback_text = self.fallback_text.clone().unwrap_or_else(|| {
            format!(
                "I'm still learning about that topic. For more specific questions, \
                 please contact our support team at {}.",
                self.support_email
            )
        });
        RetrievalParams {
            faq_threshold: self.faq_threshold,
            faq_top_k: self.faq_top_k,
            general_threshold: self.general_threshold,
            general_top_k: self.general_top_k,
            general_max_results: self.general_max_results,
            fallback_text,
        }
    }
}

fn default_faq_threshold() -> f32 {
    0.85
}
fn default_faq_top_k() -> usize {
    1
}
fn default_general_threshold() -> f32 {
    0.45
}
fn default_general_top_k() -> usize {
    3
}
fn default_general_max_results() -> usize {
    2
}
fn default_support_email() -> String {
    "support@company.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Embedding requests allowed in flight during a build.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout for the HTTP providers.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How many times the build re-issues an embed call that overran its
    /// deadline.
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            timeout_retries: default_timeout_retries(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_max_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_timeout_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Pinecone index host, e.g. `https://my-index-abc123.svc.us-east-1.pinecone.io`.
    #[serde(default)]
    pub host: Option<String>,
    /// Index metric: `cosine`, `dotproduct`, or `euclidean`.
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            namespace: default_namespace(),
            host: None,
            metric: default_metric(),
            upsert_batch_size: default_upsert_batch_size(),
        }
    }
}

impl IndexConfig {
    pub fn score_convention(&self) -> Result<ScoreConvention> {
        match self.metric.as_str() {
            "cosine" | "dotproduct" => Ok(ScoreConvention::Similarity),
            "euclidean" => Ok(ScoreConvention::Distance),
            other => bail!(
                "Unknown index metric: '{}'. Must be cosine, dotproduct, or euclidean.",
                other
            ),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_namespace() -> String {
    "eco-chatbot".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_upsert_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
