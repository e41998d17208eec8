//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the contract the build pipeline and the
//! retriever need from a similarity-search backend: namespace-scoped
//! upsert, wholesale replacement, and filtered nearest-neighbour search.
//! Backends normalize their scores to higher-is-better similarity in
//! `[0, 1]` before returning them (see
//! [`normalize_score`](crate::embedding::normalize_score)).
//!
//! An [`IndexHandle`] is the result of one successful build: the backend
//! plus the namespace and generation that build populated.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Passage, PassageKind, PassageMetadata, ScoredPassage};

/// A passage paired with its embedding vector, ready to be upserted.
#[derive(Debug, Clone)]
pub struct EmbeddedPassage {
    pub passage: Passage,
    pub vector: Vec<f32>,
}

/// Metadata predicate applied by the index before ranking.
///
/// All set fields must match. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub source: Option<String>,
    pub kind: Option<PassageKind>,
}

impl MetadataFilter {
    pub fn by_kind(kind: PassageKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, metadata: &PassageMetadata) -> bool {
        self.source
            .as_ref()
            .map(|s| *s == metadata.source)
            .unwrap_or(true)
            && self
                .kind
                .as_ref()
                .map(|k| *k == metadata.kind)
                .unwrap_or(true)
    }
}

/// Similarity-searchable store of embedded passages.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`check_config`](VectorIndex::check_config) | Verify credentials before a build |
/// | [`clear_namespace`](VectorIndex::clear_namespace) | Drop every vector in a namespace |
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite vectors by passage id |
/// | [`replace_namespace`](VectorIndex::replace_namespace) | Swap a namespace's content for a new corpus |
/// | [`staging_namespace`](VectorIndex::staging_namespace) | Where a build should write |
/// | [`resolve_namespace`](VectorIndex::resolve_namespace) | Where the latest complete build lives |
/// | [`retire_namespaces`](VectorIndex::retire_namespaces) | Drop builds superseded by a newer one |
/// | [`similarity_search`](VectorIndex::similarity_search) | Filtered top-k search |
///
/// Backends that cannot swap content atomically stage every build in a
/// namespace of its own. The previous build stays queryable until the new
/// one is complete and installed, after which it is retired.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logs (e.g. `"memory"`, `"pinecone"`).
    fn backend(&self) -> &str;

    /// Fails with [`Error::ConfigurationMissing`](crate::Error::ConfigurationMissing)
    /// when required credentials or identifiers are absent.
    fn check_config(&self) -> Result<()> {
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()>;

    async fn upsert(&self, namespace: &str, items: &[EmbeddedPassage]) -> Result<()>;

    /// Replace the namespace's content with `items`, upserting in batches
    /// of `batch_size`.
    ///
    /// The default clears then upserts. Backends that can swap content
    /// atomically should override it.
    async fn replace_namespace(
        &self,
        namespace: &str,
        items: &[EmbeddedPassage],
        batch_size: usize,
    ) -> Result<()> {
        self.clear_namespace(namespace).await?;
        for batch in items.chunks(batch_size.max(1)) {
            self.upsert(namespace, batch).await?;
        }
        Ok(())
    }

    /// Namespace that build `generation` of `namespace` writes into.
    ///
    /// The default writes in place, which is only safe when
    /// [`replace_namespace`](VectorIndex::replace_namespace) is atomic.
    fn staging_namespace(&self, namespace: &str, _generation: u64) -> String {
        namespace.to_string()
    }

    /// Namespace holding the newest complete build of `namespace`.
    async fn resolve_namespace(&self, namespace: &str) -> Result<String> {
        Ok(namespace.to_string())
    }

    /// Remove builds of `namespace` superseded by the staged namespace
    /// `keep`.
    async fn retire_namespaces(&self, _namespace: &str, _keep: &str) -> Result<()> {
        Ok(())
    }

    /// Return at most `top_k` passages matching `filter`, best first.
    async fn similarity_search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>>;
}

/// The product of one successful build.
#[derive(Clone)]
pub struct IndexHandle {
    index: Arc<dyn VectorIndex>,
    namespace: String,
    generation: u64,
    passage_count: usize,
    built_at: DateTime<Utc>,
}

impl IndexHandle {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        namespace: impl Into<String>,
        generation: u64,
        passage_count: usize,
    ) -> Self {
        Self {
            index,
            namespace: namespace.into(),
            generation,
            passage_count,
            built_at: Utc::now(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Monotonic build counter, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn passage_count(&self) -> usize {
        self.passage_count
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn backend(&self) -> &str {
        self.index.backend()
    }

    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>> {
        self.index
            .similarity_search(&self.namespace, query, top_k, filter)
            .await
    }
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("backend", &self.index.backend())
            .field("namespace", &self.namespace)
            .field("generation", &self.generation)
            .field("passage_count", &self.passage_count)
            .field("built_at", &self.built_at)
            .finish()
    }
}
