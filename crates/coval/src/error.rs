//! Error types for the node.

use coval_core::{CoValueId, CoreError, ValidationError};
use coval_perms::PermsError;
use coval_store::StoreError;
use coval_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Encoding or encryption error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// The CoValue is not loaded on this node.
    #[error("CoValue not found: {0}")]
    NotFound(CoValueId),

    /// No reachable peer has the CoValue.
    #[error("CoValue unavailable: {0}")]
    Unavailable(CoValueId),

    /// The CoValue's header does not name a branch source.
    #[error("not a branch: {0}")]
    NotABranch(CoValueId),

    /// Timed out waiting for peers.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Not authorized.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
