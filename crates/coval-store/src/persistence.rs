//! Content persistence: content messages in, content messages out.
//!
//! [`store_new_content`] writes a content message as rows: the header, one
//! session row per session (count, last signature, bytes since the last
//! checkpoint), the transactions and any checkpoint signatures.
//! [`load_content`] reads it back as content messages split at the stored
//! checkpoints, so each message can be verified on its own.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use coval_core::{
    CoValueId, KnownState, NewContentMessage, SessionId, SessionNewContent, SessionPiece,
};

use crate::error::Result;
use crate::traits::{SessionRow, SessionUpdate, StorageAdapter, StorageAdapterExt};

/// What happened when storing a content message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Everything was stored; the stored known state afterwards.
    Stored(KnownState),

    /// Some or all content could not be stored (missing header or a gap);
    /// the sender should be told what storage actually has.
    NeedsCorrection(KnownState),
}

impl StoreOutcome {
    /// The stored known state, whatever the outcome.
    pub fn known_state(&self) -> &KnownState {
        match self {
            Self::Stored(known) | Self::NeedsCorrection(known) => known,
        }
    }
}

/// Write `msg` to storage in one transaction.
///
/// Content overlapping what is stored is trimmed. A session whose content
/// starts past the stored count is skipped and reported through
/// [`StoreOutcome::NeedsCorrection`]. A checkpoint signature is recorded
/// once more than `checkpoint_bytes` have been written since the previous
/// one.
pub async fn store_new_content<S>(
    adapter: &S,
    msg: &NewContentMessage,
    checkpoint_bytes: usize,
) -> Result<StoreOutcome>
where
    S: StorageAdapter + ?Sized,
{
    let msg = msg.clone();
    adapter
        .run(move |txn| {
            let co_value = match (txn.get_co_value(&msg.id)?, &msg.header) {
                (Some(row), _) => row,
                (None, Some(header)) => {
                    txn.add_co_value(header)?;
                    match txn.get_co_value(&msg.id)? {
                        Some(row) => row,
                        None => return Ok(StoreOutcome::NeedsCorrection(KnownState::empty(msg.id))),
                    }
                }
                (None, None) => {
                    debug!(id = %msg.id, "content without header for unknown CoValue");
                    return Ok(StoreOutcome::NeedsCorrection(KnownState::empty(msg.id)));
                }
            };

            let mut needs_correction = false;
            for (session_id, content) in &msg.new {
                let existing = txn.get_single_co_value_session(co_value.row_id, session_id)?;
                let stored = existing.as_ref().map_or(0, |s| s.last_idx);

                if content.after > stored {
                    warn!(
                        id = %msg.id,
                        session = %session_id,
                        after = content.after,
                        stored,
                        "gap in content for storage, skipping session"
                    );
                    needs_correction = true;
                    continue;
                }
                if content.count_after() <= stored {
                    continue;
                }

                let skip = (stored - content.after) as usize;
                let mut bytes = existing
                    .as_ref()
                    .map_or(0, |s| s.bytes_since_last_signature as usize);
                let ses = match &existing {
                    Some(row) => row.row_id,
                    None => txn.add_session_update(
                        &SessionUpdate {
                            co_value: co_value.row_id,
                            session_id: *session_id,
                            last_idx: 0,
                            last_signature: content.last_signature,
                            bytes_since_last_signature: 0,
                        },
                        None,
                    )?,
                };

                let mut idx = stored;
                for tx in &content.new_transactions[skip..] {
                    txn.add_transaction(ses, idx, tx)?;
                    bytes += tx.canonical_bytes().len();
                    idx += 1;
                }
                if bytes > checkpoint_bytes {
                    txn.add_signature_after(ses, idx - 1, &content.last_signature)?;
                    bytes = 0;
                }

                let row = SessionRow {
                    row_id: ses,
                    co_value: co_value.row_id,
                    session_id: *session_id,
                    last_idx: stored,
                    last_signature: content.last_signature,
                    bytes_since_last_signature: 0,
                };
                txn.add_session_update(
                    &SessionUpdate {
                        co_value: co_value.row_id,
                        session_id: *session_id,
                        last_idx: idx,
                        last_signature: content.last_signature,
                        bytes_since_last_signature: bytes as u64,
                    },
                    Some(&row),
                )?;
            }

            let sessions = txn
                .get_co_value_sessions(co_value.row_id)?
                .into_iter()
                .map(|s| (s.session_id, s.last_idx))
                .collect();
            let known = KnownState {
                id: msg.id,
                header: true,
                sessions,
            };
            Ok(if needs_correction {
                StoreOutcome::NeedsCorrection(known)
            } else {
                StoreOutcome::Stored(known)
            })
        })
        .await
}

/// What storage has for `id`.
pub async fn known_state<S>(adapter: &S, id: &CoValueId) -> Result<KnownState>
where
    S: StorageAdapter + ?Sized,
{
    let Some(co_value) = adapter.get_co_value(id).await? else {
        return Ok(KnownState::empty(*id));
    };
    let sessions = adapter
        .get_co_value_sessions(co_value.row_id)
        .await?
        .into_iter()
        .map(|s| (s.session_id, s.last_idx))
        .collect();
    Ok(KnownState {
        id: *id,
        header: true,
        sessions,
    })
}

/// Stored content that the holder of `known` is missing.
///
/// Returns `None` if the CoValue isn't stored. Otherwise the first message
/// carries the header (unless `known` has it), message `k` carries the
/// `k`-th checkpoint piece of every session, and the first message of a
/// multi-part answer carries `expectContentUntil`.
pub async fn load_content<S>(
    adapter: &S,
    id: &CoValueId,
    known: Option<&KnownState>,
) -> Result<Option<Vec<NewContentMessage>>>
where
    S: StorageAdapter + ?Sized,
{
    let Some(co_value) = adapter.get_co_value(id).await? else {
        return Ok(None);
    };

    let mut messages = vec![NewContentMessage::empty(*id)];
    if !known.map_or(false, |k| k.header) {
        messages[0].header = Some(co_value.header);
    }

    let mut expect = BTreeMap::new();
    for session in adapter.get_co_value_sessions(co_value.row_id).await? {
        let after = known.map_or(0, |k| k.count(&session.session_id));
        let pieces = load_session_pieces(adapter, id, &session, after).await?;
        if let Some(last) = pieces.last() {
            expect.insert(
                session.session_id,
                last.after + last.transactions.len() as u32,
            );
        }
        for (k, piece) in pieces.into_iter().enumerate() {
            if messages.len() <= k {
                messages.push(NewContentMessage::empty(*id));
            }
            messages[k].new.insert(
                session.session_id,
                SessionNewContent {
                    after: piece.after,
                    new_transactions: piece.transactions,
                    last_signature: piece.signature,
                },
            );
        }
    }

    if messages.len() > 1 {
        messages[0].expect_content_until = Some(expect);
    }
    Ok(Some(messages))
}

/// Read one session after `after`, split at stored checkpoints.
///
/// Reading stops at the first piece with a missing or unreadable
/// transaction; pieces before it still carry valid signatures.
async fn load_session_pieces<S>(
    adapter: &S,
    id: &CoValueId,
    session: &SessionRow,
    after: u32,
) -> Result<Vec<SessionPiece>>
where
    S: StorageAdapter + ?Sized,
{
    if after >= session.last_idx {
        return Ok(Vec::new());
    }

    let mut bounds = Vec::new();
    for checkpoint in adapter.get_signatures(session.row_id, after).await? {
        if checkpoint.idx + 1 >= session.last_idx {
            break;
        }
        bounds.push((checkpoint.idx, checkpoint.signature));
    }
    bounds.push((session.last_idx - 1, session.last_signature));

    let mut pieces = Vec::new();
    let mut start = after;
    for (end, signature) in bounds {
        let rows = adapter
            .get_new_transactions_in_session(session.row_id, start, end)
            .await?;
        let contiguous = rows.len() as u32 == end - start + 1
            && rows.iter().zip(start..).all(|(row, idx)| row.idx == idx);
        if !contiguous {
            warn!(
                id = %id,
                session = %session.session_id,
                from = start,
                to = end,
                "stored session has missing transactions, truncating"
            );
            break;
        }
        pieces.push(SessionPiece {
            after: start,
            transactions: rows.into_iter().map(|row| row.tx).collect(),
            signature,
        });
        start = end + 1;
    }
    Ok(pieces)
}

/// Sessions of `msg` that storage could not take, for logging.
pub fn rejected_sessions(msg: &NewContentMessage, known: &KnownState) -> Vec<SessionId> {
    msg.new
        .iter()
        .filter(|(session, content)| content.after > known.count(session))
        .map(|(session, _)| *session)
        .collect()
}
