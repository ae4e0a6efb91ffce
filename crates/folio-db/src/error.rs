use folio_doc::DocError;

/// Errors from document-database and large-object operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A write would duplicate the key of a unique index.
    #[error("duplicate key in {collection} (index {index}): {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    /// A collection or view with this name already exists.
    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    /// Views cannot be written to.
    #[error("view is read-only: {0}")]
    ReadOnlyView(String),

    /// No large object with this id.
    #[error("large object not found: {0}")]
    LargeObjectNotFound(String),

    /// The filter or sort specification could not be interpreted.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] DocError),

    /// A pipeline stage could not be evaluated.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
