use std::path::PathBuf;

/// Errors surfaced by the engine. The snapshot/restore primitive recovers
/// locally for multi-table writes; everything else propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stored settings disagree with the runtime configuration
    /// (embedding model or vector dimension changed under an existing store).
    #[error("configuration mismatch: {0}")]
    ConfigValidation(String),

    /// The store was created by an older version and registered upgrade
    /// steps are pending. Run `migrate` before writing.
    #[error("database requires migration: {0}. Run 'khoj migrate' to upgrade")]
    MigrationRequired(String),

    /// Mutation attempted on a store opened with `read_only = true`.
    #[error("store is read-only")]
    ReadOnly,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Underlying storage failure. Multi-table writes restore their snapshot
    /// before this reaches the caller.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether a retry could plausibly succeed (used by the client facade
    /// for bounded embedding retries).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::EmbeddingFailed(_))
    }
}

impl From<lancedb::Error> for Error {
    fn from(err: lancedb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for Error {
    fn from(err: arrow_schema::ArrowError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tantivy::TantivyError> for Error {
    fn from(err: tantivy::TantivyError) -> Self {
        Error::Storage(format!("full-text index: {err}"))
    }
}

impl From<tantivy::directory::error::OpenReadError> for Error {
    fn from(err: tantivy::directory::error::OpenReadError) -> Self {
        Error::Storage(format!("full-text index: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("malformed JSON: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
