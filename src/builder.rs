//! Index lifecycle: load → segment → embed → replace namespace.
//!
//! [`IndexBuilder`] owns the active [`IndexHandle`] and guarantees that at
//! most one build runs at a time. Every caller that asks for a build while
//! one is in flight awaits the same shared future and receives the same
//! outcome, so concurrent refreshes cost one round of embedding and one
//! namespace replacement.
//!
//! # States
//!
//! ```text
//! Uninitialized ──build──▶ Building ──ok──▶ Ready ──refresh──▶ Building
//!                             │                ▲                  │
//!                             └─err─▶ Failed ──┘(next demand)     └─err─▶ Ready (prior handle kept)
//! ```
//!
//! A failed rebuild never discards a working handle: queries keep being
//! served from the previous generation.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{StreamExt, TryStreamExt};
use kb_harness_core::corpus::{load_corpus_or_general, Corpus, DocumentSource};
use kb_harness_core::embedding::Embedder;
use kb_harness_core::models::Passage;
use kb_harness_core::segment::Segmenter;
use kb_harness_core::store::{EmbeddedPassage, IndexHandle, VectorIndex};
use kb_harness_core::{Error, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{Config, EmbeddingConfig};
use crate::embedding::call_budget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Uninitialized,
    Building,
    Ready,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Uninitialized => "uninitialized",
            IndexState::Building => "building",
            IndexState::Ready => "ready",
            IndexState::Failed => "failed",
        }
    }
}

/// Knobs for one build cycle.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub namespace: String,
    pub extension: String,
    /// Embedding calls allowed in flight at once.
    pub max_concurrency: usize,
    /// Deadline for one `embed` call, provider retries included.
    pub embed_timeout: Duration,
    /// Extra attempts for an embed call that overran `embed_timeout`.
    pub timeout_retries: u32,
    pub upsert_batch_size: usize,
}

impl BuildSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.index.namespace.clone(),
            extension: config.knowledge.extension.clone(),
            max_concurrency: config.embedding.max_concurrency,
            embed_timeout: call_budget(&config.embedding),
            timeout_retries: config.embedding.timeout_retries,
            upsert_batch_size: config.index.upsert_batch_size,
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        let embedding = EmbeddingConfig::default();
        Self {
            namespace: "eco-chatbot".to_string(),
            extension: "md".to_string(),
            max_concurrency: embedding.max_concurrency,
            embed_timeout: call_budget(&embedding),
            timeout_retries: embedding.timeout_retries,
            upsert_batch_size: 100,
        }
    }
}

/// Everything a build needs, wired together once at startup.
pub struct BuildPipeline {
    source: Arc<dyn DocumentSource>,
    segmenter: Segmenter,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    settings: BuildSettings,
}

impl BuildPipeline {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        segmenter: Segmenter,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            source,
            segmenter,
            embedder,
            index,
            settings,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Load and segment the knowledge base. An unavailable directory
    /// degrades to the general passages.
    pub async fn load_corpus(&self) -> Result<Corpus> {
        load_corpus_or_general(
            self.source.as_ref(),
            &self.segmenter,
            &self.settings.extension,
        )
        .await
    }

    /// Embed every passage with at most `max_concurrency` calls in flight,
    /// preserving corpus order. The first failure aborts the batch.
    pub async fn embed_corpus(&self, corpus: &Corpus) -> Result<Vec<EmbeddedPassage>> {
        futures::stream::iter(corpus.passages.iter().cloned())
            .map(|passage| self.embed_passage(passage))
            .buffered(self.settings.max_concurrency.max(1))
            .try_collect()
            .await
    }

    /// Embed one passage. A call that overruns `embed_timeout` is issued
    /// again up to `timeout_retries` times; errors reported by the
    /// embedder itself are final.
    async fn embed_passage(&self, passage: Passage) -> Result<EmbeddedPassage> {
        let timeout = self.settings.embed_timeout;
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(timeout, self.embedder.embed(&passage.content)).await {
                Ok(Ok(vector)) => return Ok(EmbeddedPassage { passage, vector }),
                Ok(Err(e @ Error::EmbeddingFailure(_))) => return Err(e),
                Ok(Err(other)) => return Err(Error::EmbeddingFailure(other.to_string())),
                Err(_) if attempt < self.settings.timeout_retries => {
                    attempt += 1;
                    tracing::warn!(
                        passage = %passage.id,
                        source = %passage.metadata.source,
                        attempt,
                        ?timeout,
                        "embedding timed out, retrying"
                    );
                }
                Err(_) => {
                    return Err(Error::EmbeddingFailure(format!(
                        "timed out after {:?} embedding passage {} ({}), {} attempt(s)",
                        timeout,
                        passage.id,
                        passage.metadata.source,
                        attempt + 1
                    )))
                }
            }
        }
    }

    /// Run a full build cycle from the knowledge source.
    pub async fn run(&self, generation: u64) -> Result<IndexHandle> {
        self.index.check_config()?;
        let corpus = self.load_corpus().await?;
        self.build_from(corpus, generation).await
    }

    /// Embed `corpus` and write it to the namespace the index stages this
    /// generation in. The index is not touched until every passage has been
    /// embedded, and a failed write to a staged namespace is discarded.
    pub async fn build_from(&self, corpus: Corpus, generation: u64) -> Result<IndexHandle> {
        self.index.check_config()?;
        let embedded = self.embed_corpus(&corpus).await?;

        let target = self
            .index
            .staging_namespace(&self.settings.namespace, generation);
        let written = self
            .index
            .replace_namespace(&target, &embedded, self.settings.upsert_batch_size)
            .await;

        if let Err(e) = written {
            if target != self.settings.namespace {
                if let Err(cleanup) = self.index.clear_namespace(&target).await {
                    tracing::warn!(namespace = %target, error = %cleanup, "could not discard partial build");
                }
            }
            return Err(match e {
                Error::IndexWriteFailure(_) => e,
                other => Error::IndexWriteFailure(other.to_string()),
            });
        }

        Ok(IndexHandle::new(
            Arc::clone(&self.index),
            target,
            generation,
            embedded.len(),
        ))
    }

    /// Drop builds superseded by `handle` once it serves queries.
    async fn retire_superseded(&self, handle: &IndexHandle) {
        if handle.namespace() == self.settings.namespace {
            return;
        }
        match self
            .index
            .retire_namespaces(&self.settings.namespace, handle.namespace())
            .await
        {
            Ok(()) => tracing::debug!(keep = handle.namespace(), "retired superseded builds"),
            Err(e) => tracing::warn!(keep = handle.namespace(), error = %e, "could not retire superseded builds"),
        }
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<Arc<IndexHandle>>>>;

struct BuilderInner {
    state: IndexState,
    active: Option<Arc<IndexHandle>>,
    inflight: Option<(u64, SharedBuild)>,
    next_generation: u64,
    last_error: Option<Error>,
}

struct BuilderShared {
    pipeline: BuildPipeline,
    inner: Mutex<BuilderInner>,
}

impl BuilderShared {
    fn lock(&self) -> MutexGuard<'_, BuilderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of build `generation`. Only the first report for
    /// the in-flight generation changes state; the flag says whether the
    /// handle was installed.
    fn finish(
        &self,
        generation: u64,
        outcome: Result<IndexHandle>,
    ) -> (Result<Arc<IndexHandle>>, bool) {
        let mut inner = self.lock();
        let current = inner
            .inflight
            .as_ref()
            .is_some_and(|(g, _)| *g == generation);

        match outcome {
            Ok(handle) => {
                let handle = Arc::new(handle);
                if current {
                    tracing::info!(
                        generation,
                        passages = handle.passage_count(),
                        backend = handle.backend(),
                        namespace = handle.namespace(),
                        "index ready"
                    );
                    inner.active = Some(Arc::clone(&handle));
                    inner.state = IndexState::Ready;
                    inner.last_error = None;
                    inner.inflight = None;
                }
                (Ok(handle), current)
            }
            Err(err) => {
                if current {
                    inner.last_error = Some(err.clone());
                    inner.inflight = None;
                    inner.state = if inner.active.is_some() {
                        tracing::error!(generation, error = %err, "index rebuild failed, keeping previous index");
                        IndexState::Ready
                    } else {
                        tracing::error!(generation, error = %err, "index build failed");
                        IndexState::Failed
                    };
                }
                (Err(err), false)
            }
        }
    }
}

/// Single-flight owner of the active index.
#[derive(Clone)]
pub struct IndexBuilder {
    shared: Arc<BuilderShared>,
}

impl IndexBuilder {
    pub fn new(pipeline: BuildPipeline) -> Self {
        Self {
            shared: Arc::new(BuilderShared {
                pipeline,
                inner: Mutex::new(BuilderInner {
                    state: IndexState::Uninitialized,
                    active: None,
                    inflight: None,
                    next_generation: 0,
                    last_error: None,
                }),
            }),
        }
    }

    pub fn pipeline(&self) -> &BuildPipeline {
        &self.shared.pipeline
    }

    pub fn state(&self) -> IndexState {
        self.shared.lock().state
    }

    /// The handle queries are currently served from, if any.
    pub fn active(&self) -> Option<Arc<IndexHandle>> {
        self.shared.lock().active.clone()
    }

    /// Like [`active`](Self::active), but a missing handle is an
    /// [`Error::IndexNotReady`].
    pub fn get_active_index(&self) -> Result<Arc<IndexHandle>> {
        let inner = self.shared.lock();
        match (&inner.active, &inner.last_error) {
            (Some(handle), _) => Ok(Arc::clone(handle)),
            (None, Some(err)) => Err(Error::IndexNotReady(err.root_cause().to_string())),
            (None, None) => Err(Error::IndexNotReady(format!(
                "index is {}",
                inner.state.as_str()
            ))),
        }
    }

    /// Error from the most recent failed build, cleared by a success.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.lock().last_error.clone()
    }

    pub fn is_building(&self) -> bool {
        self.shared.lock().inflight.is_some()
    }

    /// Return the active handle, building one first if none exists.
    ///
    /// Concurrent first callers share one build.
    pub async fn ensure_ready(&self) -> Result<Arc<IndexHandle>> {
        let build = {
            let mut inner = self.shared.lock();
            if let Some(handle) = &inner.active {
                return Ok(Arc::clone(handle));
            }
            self.join_or_start(&mut inner, None)
        };
        build.await.map_err(|e| Error::BuildFailed(Box::new(e)))
    }

    /// Rebuild from the knowledge source, joining a build already in flight.
    pub async fn refresh(&self) -> Result<Arc<IndexHandle>> {
        let build = {
            let mut inner = self.shared.lock();
            self.join_or_start(&mut inner, None)
        };
        build.await.map_err(|e| Error::RefreshFailed(Box::new(e)))
    }

    /// Build from an already-loaded corpus. If a build is in flight, its
    /// outcome is returned instead and `corpus` is dropped.
    pub async fn build(&self, corpus: Corpus) -> Result<Arc<IndexHandle>> {
        let build = {
            let mut inner = self.shared.lock();
            self.join_or_start(&mut inner, Some(corpus))
        };
        build.await.map_err(|e| Error::BuildFailed(Box::new(e)))
    }

    /// Serve whatever the namespace already holds without rebuilding it.
    /// Used when a remote index was populated by an earlier process.
    pub async fn attach_existing(&self) -> Result<Arc<IndexHandle>> {
        if let Some(handle) = self.active() {
            return Ok(handle);
        }
        let pipeline = &self.shared.pipeline;
        pipeline.index.check_config()?;
        let namespace = pipeline
            .index
            .resolve_namespace(&pipeline.settings.namespace)
            .await?;

        let mut inner = self.shared.lock();
        if let Some(handle) = &inner.active {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(IndexHandle::new(
            Arc::clone(&pipeline.index),
            namespace,
            0,
            0,
        ));
        inner.active = Some(Arc::clone(&handle));
        if inner.inflight.is_none() {
            inner.state = IndexState::Ready;
        }
        tracing::info!(namespace = handle.namespace(), "attached to existing index");
        Ok(handle)
    }

    fn join_or_start(&self, inner: &mut BuilderInner, corpus: Option<Corpus>) -> SharedBuild {
        if let Some((generation, build)) = &inner.inflight {
            tracing::debug!(generation, "joining in-flight index build");
            return build.clone();
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.state = IndexState::Building;
        tracing::info!(generation, "starting index build");

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let outcome = match corpus {
                Some(corpus) => shared.pipeline.build_from(corpus, generation).await,
                None => shared.pipeline.run(generation).await,
            };
            let (result, installed) = shared.finish(generation, outcome);
            if let (Ok(handle), true) = (&result, installed) {
                shared.pipeline.retire_superseded(handle).await;
            }
            result
        });

        let shared = Arc::clone(&self.shared);
        let build: SharedBuild = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    shared
                        .finish(
                            generation,
                            Err(Error::Internal(format!("build task aborted: {}", join_err))),
                        )
                        .0
                }
            }
        }
        .boxed()
        .shared();

        inner.inflight = Some((generation, build.clone()));
        build
    }
}
