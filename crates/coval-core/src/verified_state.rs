//! Verified state of a CoValue: its header plus signature-checked session logs.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::content::{NewContentMessage, SessionNewContent};
use crate::crypto::{Ed25519Signature, Keypair};
use crate::error::{CoreError, ValidationError};
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId};
use crate::known_state::{KnownState, SessionCounts};
use crate::session_log::{SessionLog, DEFAULT_CHECKPOINT_BYTES};
use crate::transaction::{Privacy, Transaction, TransactionMeta, TxId};

/// The reconciled snapshot of one CoValue.
#[derive(Debug, Clone)]
pub struct VerifiedState {
    id: CoValueId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    checkpoint_bytes: usize,
}

impl VerifiedState {
    pub fn new(header: CoValueHeader) -> Self {
        Self::with_checkpoint_bytes(header, DEFAULT_CHECKPOINT_BYTES)
    }

    pub fn with_checkpoint_bytes(header: CoValueHeader, checkpoint_bytes: usize) -> Self {
        Self {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
            checkpoint_bytes,
        }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    /// Header flag plus transaction count per session.
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .filter(|(_, log)| log.tx_count() > 0)
                .map(|(id, log)| (*id, log.tx_count()))
                .collect(),
        }
    }

    /// All transactions, session by session.
    pub fn transactions(&self) -> impl Iterator<Item = (TxId, &Transaction)> {
        self.sessions.iter().flat_map(|(session, log)| {
            log.transactions().iter().enumerate().map(move |(idx, tx)| {
                (
                    TxId {
                        session: *session,
                        idx: idx as u32,
                    },
                    tx,
                )
            })
        })
    }

    /// Transactions whose signatures have been checked. Content accepted
    /// on trust stays out until [`VerifiedState::ensure_verified`] passes.
    pub fn checked_transactions(&self) -> impl Iterator<Item = (TxId, &Transaction)> {
        self.sessions.iter().flat_map(|(session, log)| {
            let verified = log.verified_count() as usize;
            log.transactions()[..verified]
                .iter()
                .enumerate()
                .map(move |(idx, tx)| {
                    (
                        TxId {
                            session: *session,
                            idx: idx as u32,
                        },
                        tx,
                    )
                })
        })
    }

    /// Known state cut back to signed boundaries within `limits`.
    ///
    /// Sessions missing from `limits` are unrestricted.
    pub fn signed_known_state(&self, limits: Option<&SessionCounts>) -> KnownState {
        let sessions = self
            .sessions
            .iter()
            .filter_map(|(session, log)| {
                let until = limit_for(limits, session);
                let (end, _) = log.signed_boundary(until)?;
                (end > 0).then_some((*session, end))
            })
            .collect();
        KnownState {
            id: self.id,
            header: true,
            sessions,
        }
    }

    /// Apply received content for one session.
    ///
    /// Content overlapping what we already have is trimmed; content starting
    /// past our count is a gap and is rejected. Returns how many
    /// transactions were added.
    pub fn try_add_content(
        &mut self,
        session: SessionId,
        content: SessionNewContent,
        trust_signature: bool,
    ) -> Result<u32, ValidationError> {
        let known = self.sessions.get(&session).map(|l| l.tx_count()).unwrap_or(0);
        if content.after > known {
            return Err(ValidationError::Gap {
                session,
                after: content.after,
                known,
            });
        }
        if content.count_after() <= known {
            return Ok(0);
        }

        let skip = (known - content.after) as usize;
        let new_transactions: Vec<Transaction> =
            content.new_transactions.into_iter().skip(skip).collect();
        let added = new_transactions.len() as u32;
        self.try_add_transactions(session, new_transactions, content.last_signature, trust_signature)?;
        Ok(added)
    }

    /// Append transactions to a session, creating the log on first use.
    pub fn try_add_transactions(
        &mut self,
        session: SessionId,
        transactions: Vec<Transaction>,
        signature: Ed25519Signature,
        trust_signature: bool,
    ) -> Result<(), ValidationError> {
        let checkpoint_bytes = self.checkpoint_bytes;
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session, checkpoint_bytes));
        let result = log.try_add(transactions, signature, trust_signature);
        if log.tx_count() == 0 {
            self.sessions.remove(&session);
        }
        result
    }

    /// Append and sign a locally created transaction.
    pub fn add_new_transaction(
        &mut self,
        session: SessionId,
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        signer: &Keypair,
        made_at: u64,
    ) -> Result<Ed25519Signature, CoreError> {
        self.add_new_transaction_at(session, changes, meta, privacy, None, signer, made_at)
    }

    /// Append and sign a local transaction written at a group position.
    #[allow(clippy::too_many_arguments)]
    pub fn add_new_transaction_at(
        &mut self,
        session: SessionId,
        changes: &[Value],
        meta: Option<&TransactionMeta>,
        privacy: Privacy<'_>,
        group_at: Option<&SessionCounts>,
        signer: &Keypair,
        made_at: u64,
    ) -> Result<Ed25519Signature, CoreError> {
        let checkpoint_bytes = self.checkpoint_bytes;
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session, checkpoint_bytes));
        let result = log.add_new_transaction_at(changes, meta, privacy, group_at, signer, made_at);
        if log.tx_count() == 0 {
            self.sessions.remove(&session);
        }
        result
    }

    /// Whether every session's signatures have been checked.
    pub fn is_verified(&self) -> bool {
        self.sessions.values().all(SessionLog::is_verified)
    }

    /// Check all signatures accepted on trust.
    ///
    /// Every session is checked; sessions that fail are cut back and the
    /// first failure is returned.
    pub fn ensure_verified(&mut self) -> Result<(), ValidationError> {
        let mut first_error = None;
        for log in self.sessions.values_mut() {
            if let Err(e) = log.ensure_verified() {
                first_error.get_or_insert(e);
            }
        }
        self.sessions.retain(|_, log| log.tx_count() > 0);
        first_error.map_or(Ok(()), Err)
    }

    /// Content the holder of `known` is missing, or `None` if nothing is.
    ///
    /// The header is sent when `known` lacks it. Sessions are split at
    /// signature checkpoints; message `k` carries the `k`-th piece of every
    /// session, and the first message of a multi-part transfer carries
    /// `expectContentUntil`.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<NewContentMessage>> {
        self.new_content_within(known, None)
    }

    /// Like [`VerifiedState::new_content_since`], sending no session past
    /// its entry in `limits`.
    pub fn new_content_within(
        &self,
        known: Option<&KnownState>,
        limits: Option<&SessionCounts>,
    ) -> Option<Vec<NewContentMessage>> {
        let send_header = known.map_or(true, |k| !k.header);

        let mut messages = vec![NewContentMessage::empty(self.id)];
        if send_header {
            messages[0].header = Some(self.header.clone());
        }

        for (session, log) in &self.sessions {
            let after = known.map_or(0, |k| k.count(session));
            let until = limit_for(limits, session);
            for (k, piece) in log.pieces_between(after, until).into_iter().enumerate() {
                if messages.len() <= k {
                    messages.push(NewContentMessage::empty(self.id));
                }
                messages[k].new.insert(
                    *session,
                    SessionNewContent {
                        after: piece.after,
                        new_transactions: piece.transactions,
                        last_signature: piece.signature,
                    },
                );
            }
        }

        if messages.len() == 1 && messages[0].is_empty() {
            return None;
        }
        if messages.len() > 1 {
            messages[0].expect_content_until = Some(self.signed_known_state(limits).sessions);
        }
        Some(messages)
    }
}

fn limit_for(limits: Option<&SessionCounts>, session: &SessionId) -> u32 {
    limits
        .and_then(|l| l.get(session).copied())
        .unwrap_or(u32::MAX)
}
