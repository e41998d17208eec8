//! Pinecone data-plane adapter.
//!
//! Talks to an existing index over its REST API (`/vectors/upsert`,
//! `/vectors/delete`, `/query`). Each passage is stored under its id with
//! flat metadata: `text`, `source`, `docType`, `section`, and `kind`.
//!
//! Credentials come from the environment (`PINECONE_API_KEY`) and the
//! index host from `[index].host` or `PINECONE_INDEX_HOST`. Missing
//! values are not an error at construction time; they surface from
//! [`check_config`](VectorIndex::check_config) as
//! [`Error::ConfigurationMissing`] when a build is attempted.
//!
//! Pinecone has no transactional swap, so every build is staged in a
//! namespace of its own, `{namespace}.{UTC timestamp}.g{generation}`. The
//! timestamp sorts lexically, which lets a later process find the newest
//! build through `/describe_index_stats`. Older builds and any unstaged
//! `{namespace}` content are deleted once a newer build is installed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kb_harness_core::embedding::{normalize_score, ScoreConvention};
use kb_harness_core::models::{Passage, PassageKind, PassageMetadata, ScoredPassage};
use kb_harness_core::store::{EmbeddedPassage, MetadataFilter, VectorIndex};
use kb_harness_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const API_VERSION: &str = "2024-07";

/// Vector metadata as stored in Pinecone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorMetadata {
    pub text: String,
    pub source: String,
    #[serde(rename = "docType")]
    pub doc_type: String,
    pub section: String,
    pub kind: String,
}

impl From<&Passage> for VectorMetadata {
    fn from(passage: &Passage) -> Self {
        Self {
            text: passage.content.clone(),
            source: passage.metadata.source.clone(),
            doc_type: passage.metadata.doc_type.clone(),
            section: passage.metadata.section.clone(),
            kind: passage.metadata.kind.as_str().to_string(),
        }
    }
}

impl VectorMetadata {
    fn into_passage(self, id: String) -> Passage {
        Passage {
            id,
            content: self.text,
            metadata: PassageMetadata {
                source: self.source,
                doc_type: self.doc_type,
                section: self.section,
                kind: PassageKind::from(self.kind),
            },
        }
    }
}

#[derive(Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: VectorMetadata,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<VectorMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct IndexStats {
    #[serde(default)]
    namespaces: HashMap<String, NamespaceStats>,
}

#[derive(Debug, Default, Deserialize)]
struct NamespaceStats {
    #[serde(rename = "vectorCount", default)]
    vector_count: u64,
}

fn staged_prefix(namespace: &str) -> String {
    format!("{}.", namespace)
}

/// Name of the namespace build `generation` of `namespace` is staged in.
pub fn stage_name(namespace: &str, at: DateTime<Utc>, generation: u64) -> String {
    format!(
        "{}{}.g{}",
        staged_prefix(namespace),
        at.format("%Y%m%dT%H%M%S%3f"),
        generation
    )
}

/// Newest populated staged build of `namespace`, or `namespace` itself
/// when nothing was staged.
fn latest_staged(namespace: &str, stats: &IndexStats) -> String {
    let prefix = staged_prefix(namespace);
    stats
        .namespaces
        .iter()
        .filter(|(name, ns)| name.starts_with(&prefix) && ns.vector_count > 0)
        .map(|(name, _)| name)
        .max()
        .cloned()
        .unwrap_or_else(|| namespace.to_string())
}

/// Namespaces made obsolete by `keep`: the unstaged base and every staged
/// build older than it. Newer builds are left to whoever is writing them.
fn superseded(namespace: &str, keep: &str, stats: &IndexStats) -> Vec<String> {
    let prefix = staged_prefix(namespace);
    let mut names: Vec<String> = stats
        .namespaces
        .keys()
        .filter(|name| {
            name.as_str() == namespace || (name.starts_with(&prefix) && name.as_str() < keep)
        })
        .cloned()
        .collect();
    names.sort();
    names
}

/// Pinecone filter expression for `filter`, or `None` when it matches all.
pub fn filter_json(filter: &MetadataFilter) -> Option<serde_json::Value> {
    let mut clauses = serde_json::Map::new();
    if let Some(source) = &filter.source {
        clauses.insert("source".into(), serde_json::json!({ "$eq": source }));
    }
    if let Some(kind) = &filter.kind {
        clauses.insert("kind".into(), serde_json::json!({ "$eq": kind.as_str() }));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(clauses))
    }
}

pub struct PineconeIndex {
    host: Option<String>,
    api_key: Option<String>,
    convention: ScoreConvention,
    client: reqwest::Client,
}

impl PineconeIndex {
    pub fn new(
        host: Option<String>,
        api_key: Option<String>,
        convention: ScoreConvention,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            host: host
                .filter(|h| !h.trim().is_empty())
                .map(|h| normalize_host(&h)),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            convention,
            client,
        })
    }

    /// Read the key from `PINECONE_API_KEY` and fall back to
    /// `PINECONE_INDEX_HOST` when `host` is unset.
    pub fn from_env(
        host: Option<String>,
        convention: ScoreConvention,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let host = host.or_else(|| std::env::var("PINECONE_INDEX_HOST").ok());
        let api_key = std::env::var("PINECONE_API_KEY").ok();
        Self::new(host, api_key, convention, timeout)
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::ConfigurationMissing("PINECONE_API_KEY is not set".into()))?;
        let host = self.host.as_deref().ok_or_else(|| {
            Error::ConfigurationMissing("index.host (or PINECONE_INDEX_HOST) is not set".into())
        })?;
        Ok((host, api_key))
    }

    /// POST `body` to `path`, returning the response on 2xx and a
    /// rendered error otherwise. A 404 is passed through when `allow_404`.
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        allow_404: bool,
    ) -> std::result::Result<reqwest::Response, String> {
        let (host, api_key) = self.credentials().map_err(|e| e.to_string())?;
        let response = self
            .client
            .post(format!("{}{}", host, path))
            .header("Api-Key", api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("POST {}: {}", path, e))?;

        let status = response.status();
        if status.is_success() || (allow_404 && status.as_u16() == 404) {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(format!("POST {} returned {}: {}", path, status, text))
    }

    /// Per-namespace vector counts from `/describe_index_stats`.
    async fn describe(&self) -> Result<IndexStats> {
        self.credentials()?;
        let response = self
            .post("/describe_index_stats", &serde_json::json!({}), false)
            .await
            .map_err(Error::SearchFailure)?;
        response
            .json()
            .await
            .map_err(|e| Error::SearchFailure(format!("invalid index stats: {}", e)))
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn backend(&self) -> &str {
        "pinecone"
    }

    fn check_config(&self) -> Result<()> {
        self.credentials().map(|_| ())
    }

    fn staging_namespace(&self, namespace: &str, generation: u64) -> String {
        stage_name(namespace, Utc::now(), generation)
    }

    async fn resolve_namespace(&self, namespace: &str) -> Result<String> {
        let stats = self.describe().await?;
        Ok(latest_staged(namespace, &stats))
    }

    async fn retire_namespaces(&self, namespace: &str, keep: &str) -> Result<()> {
        let stats = self.describe().await?;
        for name in superseded(namespace, keep, &stats) {
            self.clear_namespace(&name).await?;
            tracing::info!(namespace = %name, "retired superseded build");
        }
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let body = serde_json::json!({ "deleteAll": true, "namespace": namespace });
        // A namespace that was never written answers 404.
        self.post("/vectors/delete", &body, true)
            .await
            .map_err(Error::IndexWriteFailure)?;
        tracing::debug!(namespace, "cleared pinecone namespace");
        Ok(())
    }

    async fn upsert(&self, namespace: &str, items: &[EmbeddedPassage]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let vectors: Vec<UpsertVector<'_>> = items
            .iter()
            .map(|item| UpsertVector {
                id: &item.passage.id,
                values: &item.vector,
                metadata: VectorMetadata::from(&item.passage),
            })
            .collect();
        let body = serde_json::json!({ "vectors": vectors, "namespace": namespace });
        self.post("/vectors/upsert", &body, false)
            .await
            .map_err(Error::IndexWriteFailure)?;
        tracing::debug!(namespace, count = items.len(), "upserted vectors");
        Ok(())
    }

    async fn similarity_search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>> {
        let mut body = serde_json::json!({
            "namespace": namespace,
            "vector": query,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(filter) = filter_json(filter) {
            body["filter"] = filter;
        }

        let response = self
            .post("/query", &body, false)
            .await
            .map_err(Error::SearchFailure)?;
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::SearchFailure(format!("invalid query response: {}", e)))?;

        let mut hits: Vec<ScoredPassage> = parsed
            .matches
            .into_iter()
            .filter_map(|m| {
                let metadata = m.metadata?;
                Some(ScoredPassage {
                    passage: metadata.into_passage(m.id),
                    score: normalize_score(m.score, self.convention),
                })
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
