//! Build lifecycle and tiered search against real knowledge directories.

use async_trait::async_trait;
use kb_harness::builder::{BuildPipeline, BuildSettings, IndexBuilder, IndexState};
use kb_harness::chatbot::Chatbot;
use kb_harness::config::{Config, EmbeddingConfig};
use kb_harness::embedding::OllamaEmbedder;
use kb_harness::source_fs::FsSource;
use kb_harness_core::embedding::{Embedder, HashEmbedder};
use kb_harness_core::models::{ScoredPassage, Tier};
use kb_harness_core::retrieve::{RetrievalParams, TieredRetriever, DEFAULT_FALLBACK_TEXT};
use kb_harness_core::segment::Segmenter;
use kb_harness_core::store::memory::InMemoryIndex;
use kb_harness_core::store::{EmbeddedPassage, MetadataFilter, VectorIndex};
use kb_harness_core::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Returns fixed vectors for known texts and an orthogonal one otherwise.
struct ScriptedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl ScriptedEmbedder {
    fn new(entries: &[(&str, [f32; 3])]) -> Self {
        Self {
            vectors: entries
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0]))
    }
}

/// In-memory index that counts namespace replacements, can be told to
/// fail writes, and can report missing credentials.
struct CountingIndex {
    inner: InMemoryIndex,
    replacements: AtomicUsize,
    fail_writes: AtomicBool,
    configured: bool,
    write_delay: Duration,
}

impl CountingIndex {
    fn new() -> Self {
        Self {
            inner: InMemoryIndex::new(),
            replacements: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            configured: true,
            write_delay: Duration::from_millis(0),
        }
    }
}

#[async_trait]
impl VectorIndex for CountingIndex {
    fn backend(&self) -> &str {
        "counting"
    }

    fn check_config(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(Error::ConfigurationMissing("PINECONE_API_KEY is not set".into()))
        }
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.inner.clear_namespace(namespace).await
    }

    async fn upsert(&self, namespace: &str, items: &[EmbeddedPassage]) -> Result<()> {
        self.inner.upsert(namespace, items).await
    }

    async fn replace_namespace(
        &self,
        namespace: &str,
        items: &[EmbeddedPassage],
        batch_size: usize,
    ) -> Result<()> {
        tokio::time::sleep(self.write_delay).await;
        self.replacements.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::IndexWriteFailure("quota exceeded".into()));
        }
        self.inner.replace_namespace(namespace, items, batch_size).await
    }

    async fn similarity_search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>> {
        self.inner
            .similarity_search(namespace, query, top_k, filter)
            .await
    }
}

/// Index without an atomic swap: every build is staged under
/// `{namespace}-g{generation}`, and upserts can be told to fail once a
/// number of batches has gone through.
struct StagedIndex {
    inner: InMemoryIndex,
    upserts: AtomicUsize,
    fail_after: AtomicUsize,
    written: Mutex<Vec<String>>,
}

impl StagedIndex {
    fn new() -> Self {
        Self {
            inner: InMemoryIndex::new(),
            upserts: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
            written: Mutex::new(Vec::new()),
        }
    }

    fn fail_after_batches(&self, batches: usize) {
        self.upserts.store(0, Ordering::SeqCst);
        self.fail_after.store(batches, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for StagedIndex {
    fn backend(&self) -> &str {
        "staged"
    }

    fn staging_namespace(&self, namespace: &str, generation: u64) -> String {
        format!("{}-g{}", namespace, generation)
    }

    async fn retire_namespaces(&self, _namespace: &str, keep: &str) -> Result<()> {
        let stale: Vec<String> = self
            .written
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();
        for name in stale {
            self.inner.clear_namespace(&name).await?;
        }
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        self.inner.clear_namespace(namespace).await
    }

    async fn upsert(&self, namespace: &str, items: &[EmbeddedPassage]) -> Result<()> {
        let seen = self.upserts.fetch_add(1, Ordering::SeqCst);
        if seen >= self.fail_after.load(Ordering::SeqCst) {
            return Err(Error::IndexWriteFailure("upsert batch rejected".into()));
        }
        {
            let mut written = self.written.lock().unwrap();
            if !written.iter().any(|n| n == namespace) {
                written.push(namespace.to_string());
            }
        }
        self.inner.upsert(namespace, items).await
    }

    async fn similarity_search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPassage>> {
        self.inner
            .similarity_search(namespace, query, top_k, filter)
            .await
    }
}

fn chatbot_with(
    dir: &Path,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    settings: BuildSettings,
) -> Chatbot {
    let pipeline = BuildPipeline::new(
        Arc::new(FsSource::new(dir)),
        Segmenter::default(),
        Arc::clone(&embedder),
        index,
        settings,
    );
    Chatbot::new(
        IndexBuilder::new(pipeline),
        embedder,
        TieredRetriever::new(&RetrievalParams::default()),
    )
}

fn chatbot_over(dir: &Path, embedder: Arc<dyn Embedder>, index: Arc<CountingIndex>) -> Chatbot {
    chatbot_with(dir, embedder, index, BuildSettings::default())
}

/// Ollama stand-in that answers 503 to its first request and a fixed
/// three-dimensional vector afterwards.
async fn spawn_flaky_ollama(hits: Arc<AtomicUsize>) -> SocketAddr {
    use axum::http::StatusCode;
    use axum::Json;

    let app = axum::Router::new().route(
        "/api/embed",
        axum::routing::post(move || {
            let hits = Arc::clone(&hits);
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(serde_json::json!({ "error": "model is loading" })),
                    )
                } else {
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({ "embeddings": [[1.0, 0.0, 0.0]] })),
                    )
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

fn shipping_embedder() -> Arc<dyn Embedder> {
    Arc::new(ScriptedEmbedder::new(&[
        ("What is shipping time?", [1.0, 0.0, 0.0]),
        ("Two days.", [0.9, 0.435_889_9, 0.0]),
    ]))
}

#[tokio::test]
async fn faq_file_answers_from_faq_tier() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nTwo days.",
    )
    .unwrap();

    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::new(CountingIndex::new()));
    let result = chatbot.search("What is shipping time?").await.unwrap();

    assert_eq!(result.tier, Tier::Faq);
    assert_eq!(result.results.len(), 1);
    let answer = &result.results[0];
    assert_eq!(answer.text, "Two days.");
    assert_eq!(answer.source, "faq.md");
    assert_eq!(answer.section, "What is shipping time?");
    assert!((answer.confidence - 0.9).abs() < 1e-3);
}

#[tokio::test]
async fn empty_directory_falls_back() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(CountingIndex::new());
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Fallback);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].text, DEFAULT_FALLBACK_TEXT);
    assert_eq!(result.results[0].confidence, 0.0);

    let handle = chatbot.builder().active().unwrap();
    assert_eq!(handle.passage_count(), 3);
    assert_eq!(index.inner.len("eco-chatbot"), 3);
}

#[tokio::test]
async fn general_tier_uses_builtin_passages() {
    let tmp = TempDir::new().unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(ScriptedEmbedder::new(&[
        ("Who are you?", [1.0, 0.0, 0.0]),
        (
            "Our company provides eco-friendly solutions and products",
            [0.6, 0.8, 0.0],
        ),
        (
            "We value sustainability and environmental responsibility",
            [0.5, 0.0, 0.866_025_4],
        ),
    ]));
    let chatbot = chatbot_over(tmp.path(), embedder, Arc::new(CountingIndex::new()));

    let result = chatbot.search("Who are you?").await.unwrap();
    assert_eq!(result.tier, Tier::General);
    let sections: Vec<&str> = result.results.iter().map(|a| a.section.as_str()).collect();
    assert_eq!(sections, vec!["about", "values"]);
    assert!(result.results[0].confidence >= result.results[1].confidence);
}

#[tokio::test]
async fn first_query_builds_lazily() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("faq.md"), "## Q\nA").unwrap();
    let index = Arc::new(CountingIndex::new());
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    assert_eq!(chatbot.state(), IndexState::Uninitialized);
    assert!(chatbot.builder().active().is_none());
    chatbot.search("anything").await.unwrap();
    assert_eq!(chatbot.state(), IndexState::Ready);
    chatbot.search("anything else").await.unwrap();
    assert_eq!(index.replacements.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_query_never_builds() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(CountingIndex::new());
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    let err = chatbot.search("   ").await.unwrap_err();
    assert!(matches!(err, Error::EmptyQuery));
    assert_eq!(chatbot.state(), IndexState::Uninitialized);
    assert_eq!(index.replacements.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_share_one_build() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("faq.md"), "## Q\nA").unwrap();
    let index = Arc::new(CountingIndex {
        write_delay: Duration::from_millis(100),
        ..CountingIndex::new()
    });
    let chatbot = Arc::new(chatbot_over(
        tmp.path(),
        shipping_embedder(),
        Arc::clone(&index),
    ));

    let a = tokio::spawn({
        let chatbot = Arc::clone(&chatbot);
        async move { chatbot.refresh().await }
    });
    let b = tokio::spawn({
        let chatbot = Arc::clone(&chatbot);
        async move { chatbot.refresh().await }
    });
    let first = a.await.unwrap().unwrap();
    let second = b.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.generation(), 1);
    assert_eq!(index.replacements.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_queries_share_one_build() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(CountingIndex {
        write_delay: Duration::from_millis(100),
        ..CountingIndex::new()
    });
    let chatbot = Arc::new(chatbot_over(
        tmp.path(),
        shipping_embedder(),
        Arc::clone(&index),
    ));

    let queries: Vec<_> = (0..5)
        .map(|_| {
            let chatbot = Arc::clone(&chatbot);
            tokio::spawn(async move { chatbot.search("What is shipping time?").await })
        })
        .collect();
    for q in queries {
        assert_eq!(q.await.unwrap().unwrap().tier, Tier::Fallback);
    }
    assert_eq!(index.replacements.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_index() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nTwo days.",
    )
    .unwrap();
    let index = Arc::new(CountingIndex::new());
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    let before = chatbot.refresh().await.unwrap();
    index.fail_writes.store(true, Ordering::SeqCst);

    let err = chatbot.refresh().await.unwrap_err();
    assert!(matches!(err, Error::RefreshFailed(_)));
    assert!(matches!(err.root_cause(), Error::IndexWriteFailure(_)));

    assert_eq!(chatbot.state(), IndexState::Ready);
    let after = chatbot.builder().active().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(chatbot.builder().last_error().is_some());

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Faq);
}

#[tokio::test]
async fn missing_credentials_surface_as_not_ready() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(CountingIndex {
        configured: false,
        ..CountingIndex::new()
    });
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    let err = chatbot.search("hello").await.unwrap_err();
    assert!(matches!(err, Error::IndexNotReady(ref m) if m.contains("PINECONE_API_KEY")));
    assert_eq!(chatbot.state(), IndexState::Failed);

    let err = chatbot.refresh().await.unwrap_err();
    assert!(matches!(err, Error::RefreshFailed(_)));
    assert!(matches!(err.root_cause(), Error::ConfigurationMissing(_)));
    assert_eq!(index.replacements.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_build_is_retried_on_next_demand() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(CountingIndex::new());
    index.fail_writes.store(true, Ordering::SeqCst);
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));

    assert!(chatbot.search("hello").await.is_err());
    assert_eq!(chatbot.state(), IndexState::Failed);

    index.fail_writes.store(false, Ordering::SeqCst);
    let result = chatbot.search("hello").await.unwrap();
    assert_eq!(result.tier, Tier::Fallback);
    assert_eq!(chatbot.state(), IndexState::Ready);
    assert_eq!(chatbot.builder().active().unwrap().generation(), 2);
    assert!(chatbot.builder().last_error().is_none());
}

#[tokio::test]
async fn refresh_picks_up_new_files() {
    let tmp = TempDir::new().unwrap();
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::new(CountingIndex::new()));

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Fallback);

    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nTwo days.",
    )
    .unwrap();
    let handle = chatbot.refresh().await.unwrap();
    assert_eq!(handle.passage_count(), 4);

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Faq);
}

#[tokio::test]
async fn from_config_uses_hash_embedder_and_memory_index() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.md"),
        "## Returns\nItems can be returned within 30 days.",
    )
    .unwrap();
    let chatbot = Chatbot::from_config(&Config::for_dir(tmp.path())).unwrap();

    // Identical text embeds identically under the hash provider.
    let result = chatbot
        .search("Items can be returned within 30 days.")
        .await
        .unwrap();
    assert_eq!(result.tier, Tier::Faq);
    assert_eq!(result.results[0].section, "Returns");
    assert_eq!(chatbot.builder().active().unwrap().backend(), "memory");
}

#[tokio::test]
async fn hash_embedder_is_deterministic_across_instances() {
    let a = HashEmbedder::new(32).embed("same text").await.unwrap();
    let b = HashEmbedder::new(32).embed("same text").await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn unreadable_file_fails_build_instead_of_dropping_corpus() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nTwo days.",
    )
    .unwrap();
    let index = Arc::new(CountingIndex::new());
    let chatbot = chatbot_over(tmp.path(), shipping_embedder(), Arc::clone(&index));
    chatbot.refresh().await.unwrap();

    fs::write(tmp.path().join("menu.md"), [0xff, 0xfe, 0x00, 0x41]).unwrap();
    let err = chatbot.refresh().await.unwrap_err();
    assert!(matches!(err.root_cause(), Error::DocumentReadFailure(ref m) if m.contains("menu.md")));
    assert_eq!(index.replacements.load(Ordering::SeqCst), 1);
    assert_eq!(index.inner.len("eco-chatbot"), 4);

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Faq);
    assert_eq!(result.results[0].text, "Two days.");

    // Without a previous index the failure surfaces to the first query.
    let cold = chatbot_over(tmp.path(), shipping_embedder(), Arc::new(CountingIndex::new()));
    let err = cold.search("What is shipping time?").await.unwrap_err();
    assert!(matches!(err, Error::IndexNotReady(ref m) if m.contains("menu.md")));
    assert_eq!(cold.state(), IndexState::Failed);
}

#[tokio::test]
async fn embed_retries_fit_inside_build_deadline() {
    let tmp = TempDir::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = spawn_flaky_ollama(Arc::clone(&hits)).await;

    let mut config = Config::for_dir(tmp.path());
    config.embedding = EmbeddingConfig {
        provider: "ollama".into(),
        model: Some("nomic-embed-text".into()),
        dims: Some(3),
        max_concurrency: 1,
        max_retries: 1,
        timeout_secs: 1,
        url: Some(format!("http://{}", addr)),
        ..EmbeddingConfig::default()
    };
    let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(&config.embedding).unwrap());
    let pipeline = BuildPipeline::new(
        Arc::new(FsSource::new(tmp.path())),
        Segmenter::default(),
        embedder,
        Arc::new(InMemoryIndex::new()),
        BuildSettings::from_config(&config),
    );

    let corpus = pipeline.load_corpus().await.unwrap();
    let embedded = pipeline.embed_corpus(&corpus).await.unwrap();
    assert_eq!(embedded.len(), 3);
    // One rejected request, then one per passage.
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failed_batch_leaves_previous_build_searchable() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nTwo days.",
    )
    .unwrap();
    let index = Arc::new(StagedIndex::new());
    let settings = BuildSettings {
        upsert_batch_size: 2,
        ..BuildSettings::default()
    };
    let chatbot = chatbot_with(tmp.path(), shipping_embedder(), index.clone(), settings);

    let first = chatbot.refresh().await.unwrap();
    assert_eq!(first.namespace(), "eco-chatbot-g1");
    assert_eq!(index.inner.len("eco-chatbot-g1"), 4);

    fs::write(
        tmp.path().join("faq.md"),
        "## What is shipping time?\nFive days.",
    )
    .unwrap();
    index.fail_after_batches(1);
    let err = chatbot.refresh().await.unwrap_err();
    assert!(matches!(err.root_cause(), Error::IndexWriteFailure(_)));

    assert_eq!(chatbot.state(), IndexState::Ready);
    let active = chatbot.builder().active().unwrap();
    assert!(Arc::ptr_eq(&first, &active));
    assert_eq!(index.inner.len("eco-chatbot-g1"), 4);
    assert_eq!(index.inner.len("eco-chatbot-g2"), 0);

    let result = chatbot.search("What is shipping time?").await.unwrap();
    assert_eq!(result.tier, Tier::Faq);
    assert_eq!(result.results[0].text, "Two days.");

    index.fail_after_batches(usize::MAX);
    let third = chatbot.refresh().await.unwrap();
    assert_eq!(third.namespace(), "eco-chatbot-g3");
    assert_eq!(index.inner.len("eco-chatbot-g3"), 4);
    assert_eq!(index.inner.len("eco-chatbot-g1"), 0);
}
