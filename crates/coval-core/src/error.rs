//! Error types for coval core.

use thiserror::Error;

use crate::ids::{CoValueId, SessionId};

/// Core errors that can occur while encoding, decoding or encrypting.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("transaction {idx} not found in session {session}")]
    TransactionNotFound { session: SessionId, idx: u32 },

    #[error("session {session} belongs to another agent")]
    WrongSigner { session: SessionId },
}

/// Validation errors raised when content fails verification.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signature verification failed for session {0}")]
    SignatureFailed(SessionId),

    #[error("header hash does not match id {0}")]
    HeaderMismatch(CoValueId),

    #[error("content for session {session} starts at {after}, but {known} transactions are known")]
    Gap {
        session: SessionId,
        after: u32,
        known: u32,
    },

    #[error("no transactions to add for session {0}")]
    EmptyBatch(SessionId),

    #[error("malformed transaction: {0}")]
    Malformed(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        ValidationError::Malformed(e.to_string())
    }
}
