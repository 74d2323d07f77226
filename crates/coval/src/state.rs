//! Mutable node state.
//!
//! Everything here is synchronous. The node keeps one [`NodeState`] behind
//! a mutex that is never held across an `.await`, which makes every method
//! below a critical section: in particular appending to our own session of
//! a CoValue never interleaves with another append.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use coval_core::{
    AgentSecret, CoValueHeader, CoValueId, DecryptedTransaction, EncryptionKey, KeyId,
    KnownState, NewContentMessage, Privacy, PrivacyKind, Ruleset, SessionCounts, SessionId,
    TransactionMeta,
};
use coval_perms::{can_read, can_write, GroupState, ValidityCheck};
use coval_sync::{LocalTransactionsSyncQueue, PeerId, PeerState};

use crate::co_value_core::{CoValueCore, LoadOutcome};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::node::NodeEvent;
use crate::subscription::SubscriptionRegistry;

/// Options for [`LocalNode::get_valid_transactions`](crate::LocalNode::get_valid_transactions).
#[derive(Debug, Clone, Default)]
pub struct ValidTransactionsOptions {
    /// Only transactions at or after these per-session counts.
    pub from: Option<SessionCounts>,
    /// Leave out private transactions instead of decrypting them.
    pub ignore_private_transactions: bool,
    /// For branches, leave out the source's transactions up to the fork.
    pub skip_branch_source: bool,
}

/// Everything the node mutates.
pub(crate) struct NodeState {
    pub(crate) agent: AgentSecret,
    pub(crate) session: SessionId,
    pub(crate) config: NodeConfig,
    pub(crate) co_values: HashMap<CoValueId, CoValueCore>,
    pub(crate) peers: HashMap<PeerId, PeerState>,
    /// Current connection number per peer id; events from older
    /// connections under the same id are ignored.
    pub(crate) connections: HashMap<PeerId, u64>,
    pub(crate) next_connection: u64,
    pub(crate) readers: HashMap<PeerId, tokio::task::AbortHandle>,
    pub(crate) local_queue: LocalTransactionsSyncQueue,
    pub(crate) flush_scheduled: bool,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) events: mpsc::UnboundedSender<NodeEvent>,
    last_made_at: u64,
}

impl NodeState {
    pub(crate) fn new(
        agent: AgentSecret,
        config: NodeConfig,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        let session = SessionId::new_random(agent.agent_id());
        Self {
            agent,
            session,
            config,
            co_values: HashMap::new(),
            peers: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
            readers: HashMap::new(),
            local_queue: LocalTransactionsSyncQueue::new(),
            flush_scheduled: false,
            subscriptions: SubscriptionRegistry::default(),
            events,
            last_made_at: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn core(&self, id: &CoValueId) -> Result<&CoValueCore> {
        self.co_values
            .get(id)
            .filter(|core| core.verified().is_some())
            .ok_or(NodeError::NotFound(*id))
    }

    pub(crate) fn header(&self, id: &CoValueId) -> Result<&CoValueHeader> {
        self.core(id)?.header().ok_or(NodeError::NotFound(*id))
    }

    pub(crate) fn known_state(&self, id: &CoValueId) -> Option<KnownState> {
        self.co_values
            .get(id)
            .filter(|core| core.verified().is_some())
            .map(CoValueCore::known_state)
    }

    /// The core for `id`, created empty if we haven't heard of it.
    pub(crate) fn core_entry(&mut self, id: CoValueId) -> &mut CoValueCore {
        self.co_values
            .entry(id)
            .or_insert_with(|| CoValueCore::new(id))
    }

    /// Record reverse edges once `id`'s header is known.
    pub(crate) fn link_dependencies(&mut self, id: CoValueId) {
        let deps: Vec<CoValueId> = self
            .co_values
            .get(&id)
            .map(|core| core.depends_on().iter().copied().collect())
            .unwrap_or_default();
        for dep in deps {
            self.core_entry(dep).add_dependant(id);
        }
    }

    /// Held CoValues `id` depends on, transitively, dependencies first.
    /// `id` itself is not included.
    pub(crate) fn dependencies_in_order(&self, id: CoValueId) -> Vec<CoValueId> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        self.visit_dependencies(id, &mut seen, &mut order);
        order.retain(|dep| *dep != id);
        order
    }

    /// Every held CoValue, each after the values it depends on.
    pub(crate) fn all_in_dependency_order(&self) -> Vec<CoValueId> {
        let mut ids: Vec<CoValueId> = self
            .co_values
            .iter()
            .filter(|(_, core)| core.verified().is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        for id in ids {
            self.visit_dependencies(id, &mut seen, &mut order);
        }
        order
    }

    fn visit_dependencies(
        &self,
        root: CoValueId,
        seen: &mut BTreeSet<CoValueId>,
        order: &mut Vec<CoValueId>,
    ) {
        let mut stack = vec![(root, false)];
        while let Some((next, expanded)) = stack.pop() {
            if expanded {
                order.push(next);
                continue;
            }
            let Some(core) = self.co_values.get(&next).filter(|c| c.verified().is_some()) else {
                continue;
            };
            if !seen.insert(next) {
                continue;
            }
            stack.push((next, true));
            for dep in core.depends_on() {
                if !seen.contains(dep) {
                    stack.push((*dep, false));
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permissions
    // ─────────────────────────────────────────────────────────────────────────

    /// Replay a group from its own checked transactions.
    ///
    /// Transactions that are not plain group ops still take their place in
    /// the replay, without a group position, so the rest of their session
    /// is not held up.
    pub(crate) fn group_state(&self, group: &CoValueId) -> Result<GroupState> {
        let verified = self.core(group)?.verified().ok_or(NodeError::NotFound(*group))?;
        let transactions: Vec<DecryptedTransaction> = verified
            .checked_transactions()
            .map(|(tx_id, tx)| {
                let changes = match tx.privacy() {
                    PrivacyKind::Trusting => tx.decrypt_changes(None).ok(),
                    PrivacyKind::Private => None,
                };
                DecryptedTransaction {
                    tx_id,
                    made_at: tx.made_at(),
                    group_at: changes.as_ref().and(tx.group_at().cloned()),
                    privacy: tx.privacy(),
                    changes: changes.unwrap_or_default(),
                    meta: None,
                }
            })
            .collect();
        Ok(GroupState::replay(verified.header(), &transactions)?)
    }

    /// The group permissions of `header` are resolved through, if loaded.
    pub(crate) fn permission_group(&self, header: &CoValueHeader) -> Result<Option<GroupState>> {
        match &header.ruleset {
            Ruleset::UnsafeAllowAll => Ok(None),
            Ruleset::Group { .. } => self.group_state(&header.id()).map(Some),
            Ruleset::OwnedByGroup { group } => {
                if self.known_state(group).is_none() {
                    trace!(id = %header.id(), %group, "owner group not loaded");
                    return Ok(None);
                }
                self.group_state(group).map(Some)
            }
        }
    }

    /// Privacy new writes to `id` get by default: private when the owner
    /// group gives us a read key.
    pub(crate) fn default_privacy(&self, id: &CoValueId) -> Result<PrivacyKind> {
        let header = self.header(id)?;
        if !matches!(header.ruleset, Ruleset::OwnedByGroup { .. }) {
            return Ok(PrivacyKind::Trusting);
        }
        let readable = self
            .permission_group(header)?
            .map_or(false, |group| group.current_read_key(&self.agent).is_ok());
        Ok(if readable {
            PrivacyKind::Private
        } else {
            PrivacyKind::Trusting
        })
    }

    /// Load outcome for a value that is here.
    pub(crate) fn read_outcome(&self, id: &CoValueId) -> Result<LoadOutcome> {
        let verified = self.core(id)?.verified().ok_or(NodeError::NotFound(*id))?;
        let header = verified.header();
        if !matches!(header.ruleset, Ruleset::OwnedByGroup { .. }) {
            return Ok(LoadOutcome::Available);
        }
        let group = self.permission_group(header)?;
        let has_private = verified
            .checked_transactions()
            .any(|(_, tx)| tx.privacy() == PrivacyKind::Private);
        if has_private && !can_read(&header.ruleset, &self.agent.agent_id(), group.as_ref()) {
            return Ok(LoadOutcome::Unauthorized);
        }
        Ok(LoadOutcome::Available)
    }

    /// Per session, the first transaction of `id` that must not be passed
    /// on to other clients: the first one still unchecked or not valid.
    /// Sessions that are fine throughout are left out.
    pub(crate) fn unforwardable_from(&self, id: &CoValueId) -> Result<SessionCounts> {
        let verified = self.core(id)?.verified().ok_or(NodeError::NotFound(*id))?;
        let header = verified.header();
        let mut limits = SessionCounts::new();

        if !matches!(header.ruleset, Ruleset::UnsafeAllowAll) {
            let group = self.permission_group(header)?;
            let mut check = ValidityCheck::new(&header.ruleset, group.as_ref());
            for (tx_id, tx) in verified.checked_transactions() {
                if !check.check(&tx_id, tx.group_at()) {
                    limits.entry(tx_id.session).or_insert(tx_id.idx);
                }
            }
        }
        for (session, log) in verified.sessions() {
            if log.verified_count() < log.tx_count() {
                limits.entry(*session).or_insert(log.verified_count());
            }
        }
        Ok(limits)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Checked transactions of `id` whose authors were allowed to write
    /// them, decrypted, in replay order: `madeAt`, then session, then index.
    pub(crate) fn valid_transactions(
        &self,
        id: &CoValueId,
        opts: &ValidTransactionsOptions,
    ) -> Result<Vec<DecryptedTransaction>> {
        let verified = self.core(id)?.verified().ok_or(NodeError::NotFound(*id))?;
        let header = verified.header();
        let group = self.permission_group(header)?;
        let mut keys: HashMap<KeyId, Option<EncryptionKey>> = HashMap::new();
        let mut check = ValidityCheck::new(&header.ruleset, group.as_ref());

        let mut valid = Vec::new();
        for (tx_id, tx) in verified.checked_transactions() {
            let is_valid = check.check(&tx_id, tx.group_at());
            let from = opts
                .from
                .as_ref()
                .and_then(|from| from.get(&tx_id.session))
                .copied()
                .unwrap_or(0);
            if tx_id.idx < from {
                continue;
            }
            if !is_valid {
                trace!(%id, session = %tx_id.session, idx = tx_id.idx, "skipping invalid transaction");
                continue;
            }

            let key = match tx.key_used() {
                None => None,
                Some(_) if opts.ignore_private_transactions => continue,
                Some(key_id) => {
                    let key = keys.entry(key_id).or_insert_with(|| {
                        group
                            .as_ref()
                            .and_then(|g| g.read_key(key_id, &self.agent).ok())
                    });
                    match key {
                        Some(key) => Some(key.clone()),
                        None => {
                            trace!(%id, %key_id, "no read key for private transaction");
                            continue;
                        }
                    }
                }
            };

            let decrypted = tx
                .decrypt_changes(key.as_ref())
                .and_then(|changes| Ok((changes, tx.decrypt_meta(key.as_ref())?)));
            match decrypted {
                Ok((changes, meta)) => valid.push(DecryptedTransaction {
                    tx_id,
                    made_at: tx.made_at(),
                    group_at: tx.group_at().cloned(),
                    privacy: tx.privacy(),
                    changes,
                    meta,
                }),
                Err(e) => {
                    warn!(%id, session = %tx_id.session, idx = tx_id.idx, error = %e, "undecryptable transaction")
                }
            }
        }

        if !opts.skip_branch_source {
            if let Some(source) = header.branch_source() {
                valid.extend(self.source_until_fork(id, source, &valid, opts)?);
            }
        }

        valid.sort_by_key(|tx| (tx.made_at, tx.tx_id));
        Ok(valid)
    }

    /// The source's valid transactions a branch was forked with.
    fn source_until_fork(
        &self,
        branch: &CoValueId,
        source: CoValueId,
        branch_transactions: &[DecryptedTransaction],
        opts: &ValidTransactionsOptions,
    ) -> Result<Vec<DecryptedTransaction>> {
        let Some(fork) = first_branch_commit(branch_transactions) else {
            return Ok(Vec::new());
        };
        if self.known_state(&source).is_none() {
            debug!(%branch, %source, "branch source not loaded");
            return Ok(Vec::new());
        }
        let source_opts = ValidTransactionsOptions {
            from: None,
            ignore_private_transactions: opts.ignore_private_transactions,
            skip_branch_source: false,
        };
        Ok(self
            .valid_transactions(&source, &source_opts)?
            .into_iter()
            .filter(|tx| tx_id_before(&fork, tx))
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a locally created CoValue. Creating one that exists is a
    /// no-op, so deterministic ids (branches) converge.
    pub(crate) fn create_co_value(&mut self, header: CoValueHeader) -> Result<CoValueId> {
        let id = header.id();
        if self.known_state(&id).is_some() {
            return Ok(id);
        }
        let checkpoint_bytes = self.config.signature_checkpoint_bytes;
        let core = self.core_entry(id);
        core.set_header(header, checkpoint_bytes)?;
        let content = core.verified().and_then(|v| v.new_content_since(None));
        let requesters = core.finish_loading();
        self.link_dependencies(id);

        for msg in content.into_iter().flatten() {
            self.local_queue.push(msg);
        }
        self.schedule_flush();
        for peer in requesters {
            self.sync_co_value(&peer, id);
        }
        debug!(%id, "created CoValue");
        Ok(id)
    }

    /// Append a transaction to our session of `id`.
    pub(crate) fn make_transaction(
        &mut self,
        id: &CoValueId,
        changes: &[Value],
        privacy: PrivacyKind,
        meta: Option<&TransactionMeta>,
    ) -> Result<KnownState> {
        let header = self.header(id)?.clone();
        let group = self.permission_group(&header)?;
        let me = self.agent.agent_id();

        // The initial admin may write a group before holding any role.
        let bootstrap = matches!(header.ruleset, Ruleset::Group { initial_admin } if initial_admin == me)
            && group.as_ref().map_or(true, |g| g.role(&me).is_none());
        if !bootstrap && !can_write(&header.ruleset, &me, group.as_ref()) {
            return Err(NodeError::NotAuthorized(format!("{me} may not write to {id}")));
        }

        let key = match privacy {
            PrivacyKind::Trusting => None,
            PrivacyKind::Private => {
                let group = group.as_ref().ok_or_else(|| {
                    NodeError::InvalidOperation(format!("{id} has no group to encrypt for"))
                })?;
                Some(group.current_read_key(&self.agent)?)
            }
        };
        let privacy = match &key {
            Some((key_id, key)) => Privacy::Private {
                key_id: *key_id,
                key,
            },
            None => Privacy::Trusting,
        };

        // Permissions are judged at the group position we write at.
        let group_at = match header.ruleset {
            Ruleset::UnsafeAllowAll => None,
            Ruleset::Group { .. } | Ruleset::OwnedByGroup { .. } => {
                Some(group.as_ref().map(|g| g.position().clone()).unwrap_or_default())
            }
        };

        let made_at = self.next_made_at();
        let session = self.session;
        let verified = self
            .co_values
            .get_mut(id)
            .and_then(CoValueCore::verified_mut)
            .ok_or(NodeError::NotFound(*id))?;
        let before = verified.known_state();
        verified.add_new_transaction_at(
            session,
            changes,
            meta,
            privacy,
            group_at.as_ref(),
            &self.agent.signer,
            made_at,
        )?;
        let after = verified.known_state();
        let content = verified.new_content_since(Some(&before));

        for msg in content.into_iter().flatten() {
            self.local_queue.push(msg);
        }
        self.schedule_flush();
        self.subscriptions.notify(&after);
        Ok(after)
    }

    /// Ask the processor to flush local content on its next turn.
    pub(crate) fn schedule_flush(&mut self) {
        if self.flush_scheduled || self.local_queue.is_empty() {
            return;
        }
        self.flush_scheduled = self.events.send(NodeEvent::Flush).is_ok();
    }

    /// Wall-clock milliseconds, never going backwards within our session.
    fn next_made_at(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_made_at = self.last_made_at.max(now);
        self.last_made_at
    }
}

/// Fork point recorded by the earliest branch commit.
pub(crate) fn first_branch_commit(transactions: &[DecryptedTransaction]) -> Option<SessionCounts> {
    transactions
        .iter()
        .filter_map(|tx| match &tx.meta {
            Some(TransactionMeta::BranchCommit { from }) => Some((tx.made_at, tx.tx_id, from)),
            _ => None,
        })
        .min_by_key(|(made_at, tx_id, _)| (*made_at, *tx_id))
        .map(|(_, _, from)| from.clone())
}

fn tx_id_before(fork: &SessionCounts, tx: &DecryptedTransaction) -> bool {
    tx.tx_id.idx < fork.get(&tx.tx_id.session).copied().unwrap_or(0)
}

/// Known state reached once `msg` is applied on top of a state that
/// has the header.
pub(crate) fn content_range(msg: &NewContentMessage) -> KnownState {
    KnownState {
        id: msg.id,
        header: true,
        sessions: msg
            .new
            .iter()
            .map(|(session, content)| (*session, content.count_after()))
            .collect(),
    }
}
