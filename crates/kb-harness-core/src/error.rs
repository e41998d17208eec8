//! Error taxonomy shared by the build pipeline and the retriever.
//!
//! The type is `Clone` so that one build outcome can be handed to every
//! caller awaiting the same in-flight build.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A required credential or identifier is absent. Needs operator action.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The knowledge-base directory is missing or cannot be listed.
    #[error("knowledge source unavailable: {0}")]
    SourceUnavailable(String),

    /// A listed knowledge-base file could not be read or decoded.
    #[error("cannot read knowledge file: {0}")]
    DocumentReadFailure(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("index write failed: {0}")]
    IndexWriteFailure(String),

    #[error("index build failed: {0}")]
    BuildFailed(Box<Error>),

    #[error("refresh failed: {0}")]
    RefreshFailed(Box<Error>),

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("index not ready: {0}")]
    IndexNotReady(String),

    #[error("search failed: {0}")]
    SearchFailure(String),

    /// A build task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Strip `BuildFailed` / `RefreshFailed` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::BuildFailed(inner) | Error::RefreshFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigurationMissing(_) => "configuration_missing",
            Error::InvalidConfig(_) => "invalid_config",
            Error::SourceUnavailable(_) => "source_unavailable",
            Error::DocumentReadFailure(_) => "document_read_failed",
            Error::EmbeddingFailure(_) => "embedding_failed",
            Error::IndexWriteFailure(_) => "index_write_failed",
            Error::BuildFailed(_) => "build_failed",
            Error::RefreshFailed(_) => "refresh_failed",
            Error::EmptyQuery => "empty_query",
            Error::IndexNotReady(_) => "index_not_ready",
            Error::SearchFailure(_) => "search_failed",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
