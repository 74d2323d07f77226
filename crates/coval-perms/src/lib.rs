//! # coval permissions
//!
//! Groups, roles and read key sharing.
//!
//! ## Overview
//!
//! Access control is expressed as group transactions. Instead of mutable
//! database flags, a group's changes are replayed in causal order to compute
//! who holds which role, and when.
//!
//! ## Key Concepts
//!
//! - **Role**: reader, writer, admin, writeOnly or revoked
//! - **GroupState**: the replayed group, with role history per agent
//! - **KeyRevelation**: a group read key sealed to one member
//! - **Validity**: a transaction counts only if its author could write at
//!   that point in history
//!
//! ## Encryption Model
//!
//! Private transactions use a two-layer key model:
//!
//! 1. **Read Key**: a symmetric key (ChaCha20-Poly1305) that encrypts changes
//! 2. **Revelations**: the read key is sealed to members via X25519 ECDH
//!
//! Rotating the read key seals the previous key under the new one, so
//! historical transactions stay readable for current members while removed
//! members never learn the new key.

pub mod error;
pub mod group;
pub mod keys;
pub mod role;
pub mod validity;

pub use error::{PermsError, Result};
pub use group::{GroupOp, GroupState};
pub use keys::{open_previous_key, seal_previous_key, KeyRevelation};
pub use role::Role;
pub use validity::{can_read, can_write, is_transaction_valid, ValidityCheck};
