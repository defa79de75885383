//! Error types for Agora.

use thiserror::Error;

/// Result type alias for Agora operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Agora operations.
#[derive(Error, Debug)]
pub enum Error {
    // Deliberation rejections
    #[error("Deliberation task not found: {0}")]
    TaskNotFound(String),

    #[error("Deliberation task {0} is already terminal")]
    TaskTerminal(String),

    #[error("Task {task_id} is {status}, operation requires {required}")]
    InvalidStatus {
        task_id: String,
        status: String,
        required: String,
    },

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    #[error("Deliberation queue is shut down")]
    QueueStopped,

    // Ledger errors
    #[error("Audit ledger is not running")]
    LedgerStopped,

    #[error("Persistence failure: {0}")]
    Persistence(String),

    // Anchoring errors
    #[error("No anchor backends configured")]
    NoAnchorBackends,

    #[error("Anchor queue full, request for batch {0} dropped")]
    AnchorQueueFull(u64),

    #[error("Anchor manager is not running")]
    AnchorManagerStopped,

    #[error("Anchor backend {backend} failed: {reason}")]
    BackendFailure { backend: String, reason: String },

    // Cryptography errors
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a caller-visible rejection of a submission
    /// rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::TaskNotFound(_)
                | Error::TaskTerminal(_)
                | Error::InvalidStatus { .. }
                | Error::InvalidVote(_)
        )
    }

    pub(crate) fn backend(backend: &str, reason: impl Into<String>) -> Self {
        Error::BackendFailure {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::SerializationError(err.to_string())
        }
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureVerificationFailed
    }
}
