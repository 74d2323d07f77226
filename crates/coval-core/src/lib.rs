//! # coval core
//!
//! Pure primitives for coval: identifiers, signed session logs, CoValue
//! headers, known states and content messages.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - Immutable header; its hash is the [`CoValueId`]
//! - [`SessionLog`] - One agent-session's signed, append-only transaction log
//! - [`VerifiedState`] - Header plus all session logs of one CoValue
//! - [`KnownState`] - What a party has, exchanged to find missing content
//! - [`NewContentMessage`] - Header and/or new transactions for one CoValue
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed through deterministic CBOR. See
//! [`canonical`] module.

pub mod canonical;
pub mod cipher;
pub mod content;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod session_log;
pub mod transaction;
pub mod verified_state;

pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use cipher::{EncryptionKey, EphemeralKeyPair, X25519PublicKey, X25519StaticSecret};
pub use content::{NewContentMessage, SessionNewContent};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, ValidationError};
pub use header::{CoValueHeader, CoValueType, HeaderMeta, Ruleset};
pub use ids::{AgentId, AgentSecret, CoValueId, KeyId, SessionId};
pub use known_state::{combine_sessions, sessions_cover, KnownState, SessionCounts};
pub use session_log::{SessionLog, SessionPiece, DEFAULT_CHECKPOINT_BYTES};
pub use transaction::{
    DecryptedTransaction, Privacy, PrivacyKind, Transaction, TransactionMeta, TxId,
};
pub use verified_state::VerifiedState;
