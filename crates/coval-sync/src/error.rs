//! Error types for the sync module.

use thiserror::Error;

use crate::transport::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer's channel is closed.
    #[error("peer closed: {0}")]
    PeerClosed(PeerId),

    /// No peer with this id is connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] coval_store::StoreError),

    /// Content validation failed.
    #[error("validation error: {0}")]
    ValidationError(#[from] coval_core::ValidationError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
