use thiserror::Error;

#[derive(Debug, Error)]
pub enum HomieError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Subprocess produced no output before the first-byte deadline: {0}")]
    FirstByteTimeout(String),

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Tool input did not match its schema: {0}")]
    SchemaValidation(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Store I/O error: {0}")]
    StoreIo(String),

    #[error("Deadlock detected: nested acquire of key {key}")]
    DeadlockDetected { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HomieError {
    /// Stable kind string for structured logs and turn telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            HomieError::Config(_) => "config",
            HomieError::TransientBackend(_) => "transient_backend",
            HomieError::ModelUnavailable(_) => "model_unavailable",
            HomieError::FirstByteTimeout(_) => "first_byte_timeout",
            HomieError::ContextOverflow(_) => "context_overflow",
            HomieError::Cancelled => "cancelled",
            HomieError::SchemaValidation(_) => "schema_validation",
            HomieError::PolicyDenied(_) => "policy_denied",
            HomieError::StoreIo(_) => "store_io",
            HomieError::DeadlockDetected { .. } => "deadlock_detected",
            HomieError::Serialization(_) => "serialization",
            HomieError::Io(_) => "io",
            HomieError::Internal(_) => "internal",
        }
    }

    /// Whether the turn engine may recover locally (compaction retry,
    /// silence conversion) instead of surfacing the error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HomieError::ContextOverflow(_) | HomieError::Cancelled | HomieError::StoreIo(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HomieError>;
