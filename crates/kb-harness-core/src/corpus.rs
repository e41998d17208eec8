//! Corpus assembly: knowledge-base files plus built-in general knowledge.
//!
//! [`load_corpus`] lists the markdown files exposed by a
//! [`DocumentSource`], segments each one in listing order, and appends
//! the fixed [`general_knowledge`] passages so that the general tier
//! always has something to answer with.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{Passage, PassageKind, PassageMetadata, GENERAL_SOURCE};
use crate::segment::Segmenter;

/// A filesystem-like origin of knowledge-base files.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Human-readable location for logs (e.g. a directory path).
    fn location(&self) -> String;

    /// Identifiers of files whose name ends in `.{extension}`, in a stable
    /// order.
    ///
    /// Fails with [`Error::SourceUnavailable`] when the source itself does
    /// not exist.
    async fn list_files(&self, extension: &str) -> Result<Vec<String>>;

    /// Fails with [`Error::DocumentReadFailure`] when a listed file cannot
    /// be read.
    async fn read_file(&self, identifier: &str) -> Result<String>;
}

/// Something worth telling the operator about a corpus build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusWarning {
    /// The source exists but holds no matching files.
    NoMatchingFiles { location: String },
    /// The source could not be listed; only general knowledge was loaded.
    SourceUnavailable { reason: String },
}

/// Ordered passages produced by one build cycle.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub passages: Vec<Passage>,
    /// Identifiers of the files that were segmented.
    pub files: Vec<String>,
    pub warnings: Vec<CorpusWarning>,
}

impl Corpus {
    /// A corpus holding only the built-in general passages.
    pub fn general_only(warning: CorpusWarning) -> Self {
        Self {
            passages: general_knowledge(),
            files: Vec::new(),
            warnings: vec![warning],
        }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// The fixed general-knowledge passages appended to every corpus.
pub fn general_knowledge() -> Vec<Passage> {
    [
        (
            "about",
            "Our company provides eco-friendly solutions and products",
        ),
        (
            "values",
            "We value sustainability and environmental responsibility",
        ),
        (
            "contact",
            "Contact us at info@company.com for general inquiries",
        ),
    ]
    .into_iter()
    .enumerate()
    .map(|(ordinal, (section, content))| {
        let metadata = PassageMetadata {
            source: GENERAL_SOURCE.to_string(),
            doc_type: GENERAL_SOURCE.to_string(),
            section: section.to_string(),
            kind: PassageKind::General,
        };
        Passage::new(content, metadata, ordinal)
    })
    .collect()
}

/// Load, segment, and merge every `.{extension}` file from `source`.
///
/// # Errors
///
/// - [`Error::SourceUnavailable`] if the source cannot be listed.
/// - [`Error::DocumentReadFailure`] if any listed file cannot be read.
///   One bad file fails the whole load.
///
/// An empty listing is not an error: the corpus then holds only the
/// general passages and carries [`CorpusWarning::NoMatchingFiles`].
pub async fn load_corpus<S>(source: &S, segmenter: &Segmenter, extension: &str) -> Result<Corpus>
where
    S: DocumentSource + ?Sized,
{
    let files = source.list_files(extension).await?;
    let mut corpus = Corpus::default();

    if files.is_empty() {
        tracing::warn!(
            location = %source.location(),
            extension,
            "no knowledge-base files found"
        );
        corpus.warnings.push(CorpusWarning::NoMatchingFiles {
            location: source.location(),
        });
    }

    for file in files {
        let content = source.read_file(&file).await.map_err(|e| match e {
            Error::DocumentReadFailure(_) => e,
            other => Error::DocumentReadFailure(format!("{}: {}", file, other)),
        })?;
        let passages = segmenter.segment(&content, &file);
        tracing::debug!(file = %file, passages = passages.len(), "segmented file");
        corpus.passages.extend(passages);
        corpus.files.push(file);
    }

    let document_passages = corpus.passages.len();
    corpus.passages.extend(general_knowledge());

    tracing::info!(
        files = corpus.files.len(),
        document_passages,
        total = corpus.passages.len(),
        "corpus loaded"
    );

    Ok(corpus)
}

/// Like [`load_corpus`], but a source that cannot be listed degrades to a
/// general-only corpus instead of failing. Read failures still fail.
pub async fn load_corpus_or_general<S>(
    source: &S,
    segmenter: &Segmenter,
    extension: &str,
) -> Result<Corpus>
where
    S: DocumentSource + ?Sized,
{
    match load_corpus(source, segmenter, extension).await {
        Err(Error::SourceUnavailable(reason)) => {
            tracing::warn!(%reason, "knowledge source unavailable, using general knowledge only");
            Ok(Corpus::general_only(CorpusWarning::SourceUnavailable {
                reason,
            }))
        }
        other => other,
    }
}
