//! Error types for checkpoint operations

use thiserror::Error;

/// Convenience result type using [`CheckpointError`]
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint stores and snapshot handling
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The backend failed to persist or load a snapshot
    #[error("Checkpoint storage failed: {0}")]
    Storage(String),

    /// No checkpoint exists under the requested id
    #[error("Checkpoint '{0}' not found")]
    NotFound(String),

    /// A snapshot could not be serialized or deserialized
    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A TTL string could not be parsed
    #[error("Invalid TTL '{0}': expected forms like '30m', '24h', '7d', '90s', or 'never'")]
    InvalidTtl(String),
}
