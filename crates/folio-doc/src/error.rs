use thiserror::Error;

/// Errors produced while interpreting documents, filters, or sort specs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid sort specification: {0}")]
    InvalidSort(String),

    #[error("expected a document, got {0}")]
    NotADocument(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for DocError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result alias for document operations.
pub type DocResult<T> = Result<T, DocError>;
