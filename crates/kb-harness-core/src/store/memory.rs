//! In-memory [`VectorIndex`] implementation for local runs and tests.
//!
//! Namespaces map to `Vec`s behind a `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every vector in the namespace.
//! [`replace_namespace`](VectorIndex::replace_namespace) swaps the whole
//! namespace in one write, so readers never see a half-built corpus.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, normalize_score, ScoreConvention};
use crate::error::Result;
use crate::models::ScoredPassage;

use super::{EmbeddedPassage, MetadataFilter, VectorIndex};

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndex {
    namespaces: RwLock<HashMap<String, Vec<EmbeddedPassage>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vectors stored under `namespace`.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
        Ok(())
    }

    async fn upsert(&self, namespace: &str, items: &[EmbeddedPassage]) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let stored = namespaces.entry(namespace.to_string()).or_default();
        for item in items {
            match stored.iter_mut().find(|s| s.passage.id == item.passage.id) {
                Some(existing) => *existing = item.clone(),
                None => stored.push(item.clone()),
            }
        }
        Ok(())
    }

    async fn replace_namespace(
        &self,
        namespace: &str,
        items: &[EmbeddedPassage],
        _batch_size: usize,
    ) -> Result<()> {
        let mut fresh: Vec<EmbeddedPassage> = Vec::with_capacity(items.len());
        for item in items {
            match fresh.iter_mut().find(|s| s.passage.id == item.passage.id) {
                Some(existing) => *existing = item.clone(),
                None => fresh.push(item.clone()),
            }
        }
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), fresh);
        Ok(())
    }

    async fn similarity_search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<ScoredPassage> = stored
            .iter()
            .filter(|s| filter.matches(&s.passage.metadata))
            .map(|s| ScoredPassage {
                passage: s.passage.clone(),
                score: normalize_score(
                    cosine_similarity(query, &s.vector),
                    ScoreConvention::Similarity,
                ),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}
