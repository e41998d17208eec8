//! Tiered retrieval: FAQ match → general-knowledge match → static fallback.
//!
//! The retriever runs an ordered list of [`RetrievalStage`]s against an
//! [`IndexHandle`] and stops at the first stage that returns `Some`.
//!
//! # Default stages
//!
//! | Tier | Filter | top-k | Threshold | Output |
//! |------|--------|-------|-----------|--------|
//! | `faq` | `kind == faq` | 1 | 0.85 | best hit alone |
//! | `general` | `kind == general` | 3 | 0.45 | ≤ 2 hits, sorted, unique by content |
//! | `fallback` | - | - | - | support-contact text, confidence 0 |
//!
//! Every answer carries a `section`. Fallback answers have no document
//! behind them, so they report source [`FALLBACK_SOURCE`] and section
//! [`FALLBACK_SECTION`] rather than an empty label.
//!
//! A stage with no qualifying hits yields `None` and the next stage runs.
//! A failing index call aborts the whole query with
//! [`Error::SearchFailure`]; it never falls through to a lower tier.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::{Answer, PassageKind, QueryResult, ScoredPassage, Tier};
use crate::store::{IndexHandle, MetadataFilter};

/// Text returned when no tier finds an answer.
pub const DEFAULT_FALLBACK_TEXT: &str = "I'm still learning about that topic. For more specific questions, please contact our support team at support@company.com.";

/// `source` reported on fallback answers.
pub const FALLBACK_SOURCE: &str = "system";

/// `section` reported on fallback answers.
pub const FALLBACK_SECTION: &str = "fallback";

/// Thresholds and limits for the default stage list.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub faq_threshold: f32,
    pub faq_top_k: usize,
    pub general_threshold: f32,
    pub general_top_k: usize,
    /// Results kept from the general tier after dedup.
    pub general_max_results: usize,
    pub fallback_text: String,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            faq_threshold: 0.85,
            faq_top_k: 1,
            general_threshold: 0.45,
            general_top_k: 3,
            general_max_results: 2,
            fallback_text: DEFAULT_FALLBACK_TEXT.to_string(),
        }
    }
}

/// Inputs shared by every stage of one query.
pub struct StageContext<'a> {
    pub index: &'a IndexHandle,
    pub query: &'a str,
    pub query_vec: &'a [f32],
}

/// One tier of the fallback chain.
#[async_trait]
pub trait RetrievalStage: Send + Sync {
    fn tier(&self) -> Tier;

    /// `Ok(None)` means "no hits, try the next tier".
    async fn attempt(&self, ctx: &StageContext<'_>) -> Result<Option<Vec<Answer>>>;
}

async fn search_scoped(
    ctx: &StageContext<'_>,
    top_k: usize,
    kind: PassageKind,
) -> Result<Vec<ScoredPassage>> {
    ctx.index
        .search(ctx.query_vec, top_k, &MetadataFilter::by_kind(kind))
        .await
        .map_err(|e| match e {
            Error::SearchFailure(_) => e,
            other => Error::SearchFailure(other.to_string()),
        })
}

/// High-confidence match against FAQ passages.
pub struct FaqStage {
    pub threshold: f32,
    pub top_k: usize,
}

#[async_trait]
impl RetrievalStage for FaqStage {
    fn tier(&self) -> Tier {
        Tier::Faq
    }

    async fn attempt(&self, ctx: &StageContext<'_>) -> Result<Option<Vec<Answer>>> {
        let hits = search_scoped(ctx, self.top_k, PassageKind::Faq).await?;
        let best = hits
            .iter()
            .filter(|h| h.score >= self.threshold)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Ok(best.map(|hit| vec![Answer::from(hit)]))
    }
}

/// Broader match against general-knowledge passages.
pub struct GeneralStage {
    pub threshold: f32,
    pub top_k: usize,
    pub max_results: usize,
}

#[async_trait]
impl RetrievalStage for GeneralStage {
    fn tier(&self) -> Tier {
        Tier::General
    }

    async fn attempt(&self, ctx: &StageContext<'_>) -> Result<Option<Vec<Answer>>> {
        let mut hits: Vec<ScoredPassage> = search_scoped(ctx, self.top_k, PassageKind::General)
            .await?
            .into_iter()
            .filter(|h| h.score >= self.threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let answers: Vec<Answer> = dedup_by_content(hits)
            .iter()
            .take(self.max_results)
            .map(Answer::from)
            .collect();

        Ok((!answers.is_empty()).then_some(answers))
    }
}

/// Always answers, pointing the user to human support.
pub struct FallbackStage {
    pub text: String,
}

#[async_trait]
impl RetrievalStage for FallbackStage {
    fn tier(&self) -> Tier {
        Tier::Fallback
    }

    async fn attempt(&self, _ctx: &StageContext<'_>) -> Result<Option<Vec<Answer>>> {
        Ok(Some(vec![Answer {
            text: self.text.clone(),
            source: FALLBACK_SOURCE.to_string(),
            section: FALLBACK_SECTION.to_string(),
            confidence: 0.0,
        }]))
    }
}

/// Keep the first occurrence of each trimmed content string.
pub fn dedup_by_content(hits: Vec<ScoredPassage>) -> Vec<ScoredPassage> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.passage.content.trim().to_string()))
        .collect()
}

/// Runs stages in order and returns the first answer set.
pub struct TieredRetriever {
    stages: Vec<Box<dyn RetrievalStage>>,
}

impl TieredRetriever {
    /// FAQ → general → fallback, configured from `params`.
    pub fn new(params: &RetrievalParams) -> Self {
        Self::with_stages(vec![
            Box::new(FaqStage {
                threshold: params.faq_threshold,
                top_k: params.faq_top_k,
            }),
            Box::new(GeneralStage {
                threshold: params.general_threshold,
                top_k: params.general_top_k,
                max_results: params.general_max_results,
            }),
            Box::new(FallbackStage {
                text: params.fallback_text.clone(),
            }),
        ])
    }

    pub fn with_stages(stages: Vec<Box<dyn RetrievalStage>>) -> Self {
        Self { stages }
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.stages.iter().map(|s| s.tier()).collect()
    }

    /// Answer `query` from `index`.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyQuery`] for blank input, before anything else runs.
    /// - [`Error::SearchFailure`] if embedding the query or any index call
    ///   fails, or if no stage produced an answer.
    pub async fn search(
        &self,
        index: &IndexHandle,
        embedder: &dyn Embedder,
        query: &str,
    ) -> Result<QueryResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let query_vec = embedder
            .embed(query)
            .await
            .map_err(|e| Error::SearchFailure(format!("query embedding: {}", e)))?;

        let ctx = StageContext {
            index,
            query,
            query_vec: &query_vec,
        };

        for stage in &self.stages {
            if let Some(results) = stage.attempt(&ctx).await? {
                tracing::debug!(tier = stage.tier().as_str(), results = results.len(), "stage answered");
                return Ok(QueryResult {
                    tier: stage.tier(),
                    results,
                });
            }
            tracing::debug!(tier = stage.tier().as_str(), "stage produced no result");
        }

        Err(Error::SearchFailure(
            "no retrieval stage produced a result".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{Passage, PassageMetadata};
    use crate::store::{EmbeddedPassage, VectorIndex};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns canned hits per kind and counts search calls.
    struct ScriptedIndex {
        hits: HashMap<String, Vec<(String, f32)>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedIndex {
        fn new(hits: &[(&str, &[(&str, f32)])]) -> Self {
            Self {
                hits: hits
                    .iter()
                    .map(|(kind, list)| {
                        (
                            kind.to_string(),
                            list.iter().map(|(c, s)| (c.to_string(), *s)).collect(),
                        )
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(&[])
            }
        }
    }

    #[async_trait]
    impl VectorIndex for ScriptedIndex {
        fn backend(&self) -> &str {
            "scripted"
        }

        async fn clear_namespace(&self, _namespace: &str) -> Result<()> {
            Ok(())
        }

        async fn upsert(&self, _namespace: &str, _items: &[EmbeddedPassage]) -> Result<()> {
            Ok(())
        }

        async fn similarity_search(
            &self,
            _namespace: &str,
            _query: &[f32],
            top_k: usize,
            filter: &MetadataFilter,
        ) -> Result<Vec<ScoredPassage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::SearchFailure("connection reset".into()));
            }
            let kind = filter.kind.clone().unwrap_or(PassageKind::General);
            let list = self.hits.get(kind.as_str()).cloned().unwrap_or_default();
            Ok(list
                .into_iter()
                .take(top_k)
                .enumerate()
                .map(|(i, (content, score))| ScoredPassage {
                    passage: Passage::new(
                        &content,
                        PassageMetadata {
                            source: if kind == PassageKind::Faq {
                                "faq.md".into()
                            } else {
                                "general".into()
                            },
                            doc_type: kind.as_str().into(),
                            section: format!("s{}", i),
                            kind: kind.clone(),
                        },
                        i,
                    ),
                    score,
                })
                .collect())
        }
    }

    fn handle(index: Arc<ScriptedIndex>) -> IndexHandle {
        IndexHandle::new(index, "test", 1, 0)
    }

    async fn run(index: Arc<ScriptedIndex>, query: &str) -> Result<QueryResult> {
        let retriever = TieredRetriever::new(&RetrievalParams::default());
        retriever
            .search(&handle(index), &HashEmbedder::new(16), query)
            .await
    }

    #[tokio::test]
    async fn test_faq_short_circuits() {
        let index = Arc::new(ScriptedIndex::new(&[
            ("faq", &[("Two days.", 0.9)]),
            ("general", &[("Eco friendly", 0.99)]),
        ]));
        let result = run(index.clone(), "What is shipping time?").await.unwrap();
        assert_eq!(result.tier, Tier::Faq);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].text, "Two days.");
        assert_eq!(result.results[0].source, "faq.md");
        assert!((result.results[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_faq_threshold_is_inclusive() {
        let index = Arc::new(ScriptedIndex::new(&[("faq", &[("Exactly", 0.85)])]));
        let result = run(index, "q").await.unwrap();
        assert_eq!(result.tier, Tier::Faq);
    }

    #[tokio::test]
    async fn test_faq_below_threshold_falls_to_general() {
        let index = Arc::new(ScriptedIndex::new(&[
            ("faq", &[("Two days.", 0.84)]),
            ("general", &[("Eco friendly", 0.6)]),
        ]));
        let result = run(index.clone(), "q").await.unwrap();
        assert_eq!(result.tier, Tier::General);
        assert_eq!(result.results[0].text, "Eco friendly");
        assert_eq!(index.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_general_sorted_deduped_and_capped() {
        let index = Arc::new(ScriptedIndex::new(&[(
            "general",
            &[("A", 0.5), ("B", 0.7), ("B", 0.6)],
        )]));
        let result = run(index, "q").await.unwrap();
        assert_eq!(result.tier, Tier::General);
        let texts: Vec<&str> = result.results.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(texts, vec!["B", "A"]);
        assert!((result.results[0].confidence - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_general_never_exceeds_two() {
        let index = Arc::new(ScriptedIndex::new(&[(
            "general",
            &[("A", 0.9), ("B", 0.8), ("C", 0.7)],
        )]));
        let result = run(index, "q").await.unwrap();
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn test_general_respects_top_k_window() {
        let index = Arc::new(ScriptedIndex::new(&[(
            "general",
            &[("A", 0.1), ("B", 0.1), ("C", 0.1), ("D", 0.99)],
        )]));
        let result = run(index, "q").await.unwrap();
        assert_eq!(result.tier, Tier::Fallback);
    }

    #[tokio::test]
    async fn test_fallback_when_nothing_clears() {
        let index = Arc::new(ScriptedIndex::new(&[
            ("faq", &[("Two days.", 0.2)]),
            ("general", &[("Eco friendly", 0.44)]),
        ]));
        let result = run(index.clone(), "q").await.unwrap();
        assert_eq!(result.tier, Tier::Fallback);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].confidence, 0.0);
        assert_eq!(result.results[0].source, "system");
        assert_eq!(result.results[0].section, FALLBACK_SECTION);
        assert!(result.results[0].text.contains("support@company.com"));
        assert_eq!(index.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_query_rejected_before_search() {
        let index = Arc::new(ScriptedIndex::new(&[]));
        let err = run(index.clone(), "   \n").await.unwrap_err();
        assert!(matches!(err, Error::EmptyQuery));
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_index_failure_aborts_query() {
        let index = Arc::new(ScriptedIndex::failing());
        let err = run(index.clone(), "q").await.unwrap_err();
        assert!(matches!(err, Error::SearchFailure(_)));
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_thresholds() {
        let params = RetrievalParams {
            faq_threshold: 0.5,
            ..RetrievalParams::default()
        };
        let index = Arc::new(ScriptedIndex::new(&[("faq", &[("Two days.", 0.6)])]));
        let result = TieredRetriever::new(&params)
            .search(&handle(index), &HashEmbedder::new(16), "q")
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Faq);
    }

    #[test]
    fn test_default_stage_order() {
        let retriever = TieredRetriever::new(&RetrievalParams::default());
        assert_eq!(
            retriever.tiers(),
            vec![Tier::Faq, Tier::General, Tier::Fallback]
        );
    }

    #[test]
    fn test_dedup_keeps_first() {
        let meta = PassageMetadata {
            source: "general".into(),
            doc_type: "general".into(),
            section: "s".into(),
            kind: PassageKind::General,
        };
        let hits = vec![
            ScoredPassage {
                passage: Passage::new("same", meta.clone(), 0),
                score: 0.9,
            },
            ScoredPassage {
                passage: Passage::new("same", meta.clone(), 1),
                score: 0.8,
            },
            ScoredPassage {
                passage: Passage::new("other", meta, 2),
                score: 0.7,
            },
        ];
        let deduped = dedup_by_content(hits);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].score, 0.9);
    }
}
