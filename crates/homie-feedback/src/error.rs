use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, FeedbackError>;
