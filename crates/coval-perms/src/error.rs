//! Error types for the permissions module.

use thiserror::Error;

use coval_core::CoValueId;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The CoValue is not a group.
    #[error("{0} is not a group")]
    NotAGroup(CoValueId),

    /// A group change could not be understood.
    #[error("invalid group op: {0}")]
    InvalidOp(String),

    /// No revelation of the key is reachable for this agent.
    #[error("no access to read key {0}")]
    KeyNotRevealed(String),

    /// Decryption error.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] coval_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
