use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Person not found: {0}")]
    PersonNotFound(String),

    #[error("Evidence quote is not verbatim in the source text")]
    EvidenceNotVerbatim,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
