use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Summarizer failed: {0}")]
    Summarize(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
