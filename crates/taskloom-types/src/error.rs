use thiserror::Error;

/// Errors from task store implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
