use folio_db::DbError;
use thiserror::Error;

/// Errors surfaced by object and payload operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object or payload does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object or payload already exists, or a racing insert lost.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Embedded-document payload content is not a JSON document.
    #[error("invalid payload {pid}: {reason}")]
    InvalidPayload { pid: String, reason: String },

    /// The document database or large-object store failed.
    #[error("{context}: {source}")]
    BackendFailure {
        context: String,
        #[source]
        source: DbError,
    },

    /// Configuration could not be read or is inconsistent.
    #[error("config error: {0}")]
    Config(String),
}

impl StorageError {
    /// Classify a database error raised while doing `context`.
    ///
    /// Unique-index violations become `Conflict`; everything else is a
    /// `BackendFailure`.
    pub fn from_db(err: DbError, context: impl Into<String>) -> Self {
        match err {
            DbError::DuplicateKey { .. } => Self::Conflict(format!("{}: {err}", context.into())),
            other => Self::BackendFailure {
                context: context.into(),
                source: other,
            },
        }
    }

    /// Returns `true` for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for [`StorageError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<DbError> for StorageError {
    fn from(err: DbError) -> Self {
        Self::from_db(err, "database operation failed")
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_is_a_conflict() {
        let err = StorageError::from_db(
            DbError::DuplicateKey {
                collection: "tf_obj_meta".into(),
                index: "redboxOid".into(),
                key: "[\"x\"]".into(),
            },
            "create x",
        );
        assert!(err.is_conflict());
        assert!(err.to_string().contains("create x"));
    }

    #[test]
    fn other_db_errors_keep_their_context() {
        let err = StorageError::from_db(DbError::Pipeline("boom".into()), "paged query on default");
        match err {
            StorageError::BackendFailure { context, source } => {
                assert_eq!(context, "paged query on default");
                assert!(matches!(source, DbError::Pipeline(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
