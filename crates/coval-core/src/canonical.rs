//! Canonical CBOR encoding for deterministic hashing.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//!
//! Headers are hashed into CoValue ids and transactions are fed into the
//! running session hash, so the same header or transaction must produce
//! identical bytes on every platform.

use ciborium::value::Value;

use crate::header::{CoValueHeader, Ruleset};
use crate::known_state::SessionCounts;
use crate::transaction::Transaction;

/// Header field keys (integer keys for compact encoding).
mod header_keys {
    pub const TYPE: u64 = 0;
    pub const RULESET: u64 = 1;
    pub const META: u64 = 2;
    pub const UNIQUENESS: u64 = 3;
}

/// Transaction field keys.
mod tx_keys {
    pub const PRIVACY: u64 = 0;
    pub const BODY: u64 = 1;
    pub const KEY_USED: u64 = 2;
    pub const MADE_AT: u64 = 3;
    pub const META: u64 = 4;
    pub const GROUP_AT: u64 = 5;
}

/// Encode a CoValue header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &CoValueHeader) -> Vec<u8> {
    let value = header_to_cbor_value(header);
    encode_cbor_value_canonical(&value)
}

/// Encode a transaction to canonical CBOR bytes.
///
/// Private transactions are encoded in their encrypted form: the running
/// hash covers exactly what travels on the wire.
pub fn canonical_transaction_bytes(tx: &Transaction) -> Vec<u8> {
    let value = transaction_to_cbor_value(tx);
    encode_cbor_value_canonical(&value)
}

fn int(key: u64) -> Value {
    Value::Integer(key.into())
}

fn opt_text(s: Option<String>) -> Value {
    s.map(Value::Text).unwrap_or(Value::Null)
}

fn header_to_cbor_value(header: &CoValueHeader) -> Value {
    let ruleset = match &header.ruleset {
        Ruleset::Group { initial_admin } => Value::Map(vec![
            (int(0), Value::Text("group".into())),
            (int(1), Value::Text(initial_admin.to_string())),
        ]),
        Ruleset::OwnedByGroup { group } => Value::Map(vec![
            (int(0), Value::Text("ownedByGroup".into())),
            (int(1), Value::Text(group.to_string())),
        ]),
        Ruleset::UnsafeAllowAll => Value::Map(vec![(int(0), Value::Text("unsafeAllowAll".into()))]),
    };

    let meta = match &header.meta {
        Some(meta) => Value::Map(vec![
            (int(0), opt_text(meta.branch.clone())),
            (int(1), opt_text(meta.source.map(|s| s.to_string()))),
        ]),
        None => Value::Null,
    };

    Value::Map(vec![
        (int(header_keys::TYPE), Value::Text(header.co_type.as_str().into())),
        (int(header_keys::RULESET), ruleset),
        (int(header_keys::META), meta),
        (int(header_keys::UNIQUENESS), opt_text(header.uniqueness.clone())),
    ])
}

fn sessions_value(counts: &SessionCounts) -> Value {
    Value::Map(
        counts
            .iter()
            .map(|(session, count)| (Value::Text(session.to_string()), int(u64::from(*count))))
            .collect(),
    )
}

fn transaction_to_cbor_value(tx: &Transaction) -> Value {
    let (privacy, body, key_used, made_at, meta) = match tx {
        Transaction::Trusting {
            changes,
            made_at,
            meta,
            ..
        } => (
            0u64,
            changes.to_string(),
            Value::Null,
            *made_at,
            opt_text(meta.as_ref().map(|m| m.to_string())),
        ),
        Transaction::Private {
            encrypted_changes,
            key_used,
            made_at,
            encrypted_meta,
            ..
        } => (
            1u64,
            encrypted_changes.clone(),
            Value::Text(key_used.to_string()),
            *made_at,
            opt_text(encrypted_meta.clone()),
        ),
    };

    let mut entries = vec![
        (int(tx_keys::PRIVACY), int(privacy)),
        (int(tx_keys::BODY), Value::Text(body)),
        (int(tx_keys::KEY_USED), key_used),
        (int(tx_keys::MADE_AT), Value::Integer(made_at.into())),
        (int(tx_keys::META), meta),
    ];
    // Absent rather than null, so values without a group keep their bytes.
    if let Some(group_at) = tx.group_at() {
        entries.push((int(tx_keys::GROUP_AT), sessions_value(group_at)));
    }
    Value::Map(entries)
}

/// Encode a CBOR Value to canonical bytes.
fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr),
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        // Null, and any variant this module never builds.
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item);
    }
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut key_value_pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();

    key_value_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, key_value_pairs.len() as u64);

    for (key_bytes, value) in key_value_pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CoValueType, HeaderMeta};
    use crate::ids::CoValueId;
    use serde_json::json;

    #[test]
    fn test_encode_uint_sizes() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_uint(&mut buf, 0, 65536);
        assert_eq!(buf, vec![0x1a, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_negative_integer() {
        let mut buf = Vec::new();
        encode_integer(&mut buf, (-1i64).into());
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_keys_sorted() {
        let a = Value::Map(vec![(int(3), int(1)), (int(0), int(2))]);
        let b = Value::Map(vec![(int(0), int(2)), (int(3), int(1))]);
        assert_eq!(encode_cbor_value_canonical(&a), encode_cbor_value_canonical(&b));
    }

    #[test]
    fn test_header_bytes_deterministic() {
        let header = CoValueHeader {
            co_type: CoValueType::CoMap,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: Some(HeaderMeta {
                branch: Some("feature".into()),
                source: Some(CoValueId::from_bytes([1; 32])),
            }),
            uniqueness: None,
        };
        assert_eq!(
            canonical_header_bytes(&header),
            canonical_header_bytes(&header.clone())
        );
    }

    #[test]
    fn test_transaction_bytes_cover_changes() {
        let a = Transaction::Trusting {
            changes: json!([{"op": "set", "key": "a", "value": 1}]),
            made_at: 10,
            meta: None,
            group_at: None,
        };
        let b = Transaction::Trusting {
            changes: json!([{"op": "set", "key": "a", "value": 2}]),
            made_at: 10,
            meta: None,
            group_at: None,
        };
        assert_ne!(canonical_transaction_bytes(&a), canonical_transaction_bytes(&b));
    }
}
