//! The chatbot service: lazy index initialization plus tiered search.
//!
//! A [`Chatbot`] is cheap to share behind an `Arc`. The first query (or an
//! explicit [`refresh`](Chatbot::refresh)) triggers the index build;
//! later queries read the active handle without waiting on rebuilds.

use anyhow::Context;
use kb_harness_core::embedding::Embedder;
use kb_harness_core::models::QueryResult;
use kb_harness_core::retrieve::TieredRetriever;
use kb_harness_core::segment::Segmenter;
use kb_harness_core::store::IndexHandle;
use kb_harness_core::{Error, Result};
use std::sync::Arc;

use crate::builder::{BuildPipeline, BuildSettings, IndexBuilder, IndexState};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::index::create_index;
use crate::source_fs::FsSource;

pub struct Chatbot {
    builder: IndexBuilder,
    embedder: Arc<dyn Embedder>,
    retriever: TieredRetriever,
}

impl Chatbot {
    pub fn new(builder: IndexBuilder, embedder: Arc<dyn Embedder>, retriever: TieredRetriever) -> Self {
        Self {
            builder,
            embedder,
            retriever,
        }
    }

    /// Wire the filesystem source, configured embedder, and index backend.
    /// Nothing is built until the first query or refresh.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(config)?;
        let splitter = config.chunking.splitter().context("invalid [chunking]")?;
        let source = Arc::new(FsSource::new(&config.knowledge.dir));

        tracing::info!(
            knowledge_dir = %config.knowledge.dir.display(),
            embedder = embedder.model_name(),
            backend = index.backend(),
            namespace = %config.index.namespace,
            "chatbot configured"
        );

        let pipeline = BuildPipeline::new(
            source,
            Segmenter::new(splitter),
            Arc::clone(&embedder),
            index,
            BuildSettings::from_config(config),
        );

        Ok(Self::new(
            IndexBuilder::new(pipeline),
            embedder,
            TieredRetriever::new(&config.retrieval.params()),
        ))
    }

    pub fn builder(&self) -> &IndexBuilder {
        &self.builder
    }

    pub fn state(&self) -> IndexState {
        self.builder.state()
    }

    /// Answer `query` from the FAQ, general, or fallback tier.
    ///
    /// Blank queries fail with [`Error::EmptyQuery`] without touching the
    /// index. If no index exists and building one fails, the error is
    /// [`Error::IndexNotReady`].
    pub async fn search(&self, query: &str) -> Result<QueryResult> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }

        let handle = self
            .builder
            .ensure_ready()
            .await
            .map_err(|e| Error::IndexNotReady(e.root_cause().to_string()))?;

        let result = self
            .retriever
            .search(&handle, self.embedder.as_ref(), query)
            .await?;
        tracing::debug!(
            tier = result.tier.as_str(),
            results = result.results.len(),
            generation = handle.generation(),
            "query answered"
        );
        Ok(result)
    }

    /// Rebuild the index; concurrent callers share one build.
    pub async fn refresh(&self) -> Result<Arc<IndexHandle>> {
        self.builder.refresh().await
    }
}
