//! Branching and merging.
//!
//! A branch is a separate CoValue whose header names its source and the
//! branch name. Its id depends only on type, name, owner and source, so
//! every peer deriving the same branch gets the same CoValue. The fork
//! point is recorded by a branch commit on the branch; merging writes a
//! merge commit on the source and replays the branch's new transactions
//! after it. Merge commits record how far each merge got, which makes
//! merging idempotent and incremental.

use tracing::{debug, info};

use coval_core::{CoValueHeader, CoValueId, PrivacyKind, Ruleset, SessionCounts, TransactionMeta};

use crate::error::{NodeError, Result};
use crate::node::LocalNode;
use crate::state::{first_branch_commit, NodeState, ValidTransactionsOptions};

/// A merge recorded on a branch source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCommit {
    /// The branch that was merged.
    pub branch: CoValueId,
    /// Branch sessions as of the merge.
    pub merged: SessionCounts,
    /// How many branch transactions were replayed.
    pub count: usize,
}

impl LocalNode {
    /// Header of the branch `name` of `source`.
    ///
    /// Without an explicit `owner` the branch is owned by the source's
    /// owner group.
    pub fn get_branch_header(
        &self,
        source: CoValueId,
        name: &str,
        owner: Option<CoValueId>,
    ) -> Result<CoValueHeader> {
        self.lock().branch_header(source, name, owner)
    }

    /// Create (or reuse) the branch `name` of `source`.
    pub async fn create_branch(
        &self,
        source: CoValueId,
        name: &str,
        owner: Option<CoValueId>,
    ) -> Result<CoValueId> {
        self.require(source).await?;
        let header = self.get_branch_header(source, name, owner)?;
        if let Some(owner) = header.owner() {
            self.require(owner).await?;
        }

        let mut state = self.lock();
        let id = header.id();
        if state.known_state(&id).is_some() && state.branch_commit(&id)?.is_some() {
            debug!(%source, branch = %id, name, "branch exists");
            return Ok(id);
        }

        let fork = state
            .known_state(&source)
            .ok_or(NodeError::NotFound(source))?
            .sessions;
        let privacy = state.commit_privacy(&header)?;
        state.create_co_value(header)?;
        state.make_transaction(
            &id,
            &[],
            privacy,
            Some(&TransactionMeta::BranchCommit { from: fork }),
        )?;
        info!(%source, branch = %id, name, "branch created");
        Ok(id)
    }

    /// The source `branch` was forked from, loaded.
    pub async fn get_branch_source(&self, branch: CoValueId) -> Result<CoValueId> {
        self.require(branch).await?;
        let source = self
            .lock()
            .header(&branch)?
            .branch_source()
            .ok_or(NodeError::NotABranch(branch))?;
        self.require(source).await?;
        Ok(source)
    }

    /// Fold the branch's new transactions into its source.
    ///
    /// Returns the source. Merging a branch with nothing new is a no-op.
    pub async fn merge_branch(&self, branch: CoValueId) -> Result<CoValueId> {
        let target = self.get_branch_source(branch).await?;
        self.lock().merge_branch(branch, target)?;
        Ok(target)
    }

    /// Merge commits recorded on `id`, in replay order.
    pub fn merge_commits(&self, id: CoValueId) -> Result<Vec<MergeCommit>> {
        self.lock().merge_commits(&id)
    }

    /// The fork point of branch `id`, if it has a readable branch commit.
    pub fn branch_commit(&self, id: CoValueId) -> Result<Option<SessionCounts>> {
        self.lock().branch_commit(&id)
    }
}

impl NodeState {
    pub(crate) fn branch_header(
        &self,
        source: CoValueId,
        name: &str,
        owner: Option<CoValueId>,
    ) -> Result<CoValueHeader> {
        let header = self.header(&source)?;
        let owner = owner.or_else(|| header.owner()).ok_or_else(|| {
            NodeError::InvalidOperation(format!("branch of {source} needs an owner group"))
        })?;
        Ok(CoValueHeader::branch(header.co_type, name, owner, source))
    }

    /// Privacy of branch and merge commits on a value with `header`.
    ///
    /// On group-owned values commits are always encrypted, so readers
    /// without the key learn nothing of the branch structure; without a
    /// readable key no commit can be written.
    pub(crate) fn commit_privacy(&self, header: &CoValueHeader) -> Result<PrivacyKind> {
        if !matches!(header.ruleset, Ruleset::OwnedByGroup { .. }) {
            return Ok(PrivacyKind::Trusting);
        }
        let id = header.id();
        let group = self.permission_group(header)?.ok_or_else(|| {
            NodeError::InvalidOperation(format!("{id} has no group to encrypt commits for"))
        })?;
        group.current_read_key(&self.agent)?;
        Ok(PrivacyKind::Private)
    }

    pub(crate) fn merge_commits(&self, id: &CoValueId) -> Result<Vec<MergeCommit>> {
        let opts = ValidTransactionsOptions {
            skip_branch_source: true,
            ..Default::default()
        };
        Ok(self
            .valid_transactions(id, &opts)?
            .into_iter()
            .filter_map(|tx| match tx.meta {
                Some(TransactionMeta::MergeCommit { merge, id, count }) => Some(MergeCommit {
                    branch: id,
                    merged: merge,
                    count,
                }),
                _ => None,
            })
            .collect())
    }

    pub(crate) fn branch_commit(&self, id: &CoValueId) -> Result<Option<SessionCounts>> {
        let opts = ValidTransactionsOptions {
            skip_branch_source: true,
            ..Default::default()
        };
        Ok(first_branch_commit(&self.valid_transactions(id, &opts)?))
    }

    /// Merge under one lock: either every transaction is written or none.
    pub(crate) fn merge_branch(&mut self, branch: CoValueId, target: CoValueId) -> Result<()> {
        let mut merged = SessionCounts::new();
        for commit in self.merge_commits(&target)? {
            if commit.branch == branch {
                coval_core::combine_sessions(&mut merged, &commit.merged);
            }
        }

        let opts = ValidTransactionsOptions {
            from: Some(merged),
            skip_branch_source: true,
            ..Default::default()
        };
        let transactions: Vec<_> = self
            .valid_transactions(&branch, &opts)?
            .into_iter()
            .filter(|tx| !tx.changes.is_empty())
            .collect();
        if transactions.is_empty() {
            debug!(%branch, %target, "nothing to merge");
            return Ok(());
        }

        // Check everything that could fail before writing anything.
        let header = self.header(&target)?.clone();
        let commit_privacy = self.commit_privacy(&header)?;
        if transactions.iter().any(|tx| tx.privacy == PrivacyKind::Private) {
            let group = self.permission_group(&header)?.ok_or_else(|| {
                NodeError::InvalidOperation(format!(
                    "{target} has no group to encrypt merged transactions for"
                ))
            })?;
            group.current_read_key(&self.agent)?;
        }

        let branch_sessions = self
            .known_state(&branch)
            .ok_or(NodeError::NotFound(branch))?
            .sessions;
        let commit = TransactionMeta::MergeCommit {
            merge: branch_sessions,
            id: branch,
            count: transactions.len(),
        };
        self.make_transaction(&target, &[], commit_privacy, Some(&commit))?;
        for tx in &transactions {
            self.make_transaction(&target, &tx.changes, tx.privacy, None)?;
        }
        info!(%branch, %target, count = transactions.len(), "merged branch");
        Ok(())
    }
}
