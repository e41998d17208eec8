//! Core data models for the retrieval pipeline.
//!
//! A [`Passage`] is the unit that gets embedded and stored. Search stages
//! turn [`ScoredPassage`] hits into [`Answer`]s, grouped under the
//! [`Tier`] that produced them in a [`QueryResult`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Section label for text that precedes the first heading of a file.
pub const INTRODUCTION_SECTION: &str = "introduction";

/// `source` and `doc_type` of the built-in general-knowledge passages.
pub const GENERAL_SOURCE: &str = "general";

/// `doc_type` of the file whose passages make up the FAQ tier.
pub const FAQ_DOC_TYPE: &str = "faq";

/// Classification used to scope similarity searches.
///
/// Serialized as a flat string (`"faq"`, `"general"`, or the document
/// type) so that it survives round-trips through index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PassageKind {
    Faq,
    General,
    Document(String),
}

impl PassageKind {
    /// Kind for passages cut from a knowledge-base file with `doc_type`.
    pub fn for_doc_type(doc_type: &str) -> Self {
        if doc_type == FAQ_DOC_TYPE {
            PassageKind::Faq
        } else {
            PassageKind::Document(doc_type.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PassageKind::Faq => "faq",
            PassageKind::General => "general",
            PassageKind::Document(doc_type) => doc_type,
        }
    }
}

impl From<String> for PassageKind {
    fn from(label: String) -> Self {
        match label.as_str() {
            "faq" => PassageKind::Faq,
            "general" => PassageKind::General,
            _ => PassageKind::Document(label),
        }
    }
}

impl From<PassageKind> for String {
    fn from(kind: PassageKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassageMetadata {
    /// Originating file name, or `"general"`.
    pub source: String,
    /// File name without its extension.
    pub doc_type: String,
    /// Enclosing heading, or `"introduction"`.
    pub section: String,
    pub kind: PassageKind,
}

/// A chunk of knowledge-base text plus the metadata needed to filter it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Deterministic id: SHA-256 over source, section, ordinal and content.
    pub id: String,
    pub content: String,
    pub metadata: PassageMetadata,
}

impl Passage {
    /// Build a passage, deriving its id from `ordinal` (position within
    /// its origin) and content. Content is stored trimmed.
    pub fn new(content: &str, metadata: PassageMetadata, ordinal: usize) -> Self {
        let content = content.trim().to_string();
        let mut hasher = Sha256::new();
        hasher.update(metadata.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(metadata.section.as_bytes());
        hasher.update([0u8]);
        hasher.update((ordinal as u64).to_le_bytes());
        hasher.update(content.as_bytes());
        let id = format!("{:x}", hasher.finalize());

        Self {
            id,
            content,
            metadata,
        }
    }
}

/// A passage returned from a similarity search.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Passage,
    /// Similarity in `[0.0, 1.0]`; higher is more similar.
    pub score: f32,
}

/// Retrieval stage that produced a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Faq,
    General,
    Fallback,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Faq => "faq",
            Tier::General => "general",
            Tier::Fallback => "fallback",
        }
    }
}

/// One item of a [`QueryResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub source: String,
    pub section: String,
    pub confidence: f32,
}

impl From<&ScoredPassage> for Answer {
    fn from(hit: &ScoredPassage) -> Self {
        Answer {
            text: hit.passage.content.clone(),
            source: hit.passage.metadata.source.clone(),
            section: hit.passage.metadata.section.clone(),
            confidence: hit.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub tier: Tier,
    pub results: Vec<Answer>,
}
