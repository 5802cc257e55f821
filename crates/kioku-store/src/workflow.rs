//! Approval workflow: the one operation that couples store, diff and queue.
//!
//! # Flow
//!
//! ```text
//! agent ── propose ──▶ ProposalStore (Pending)
//!                           │
//! human ── approve ─────────┤
//!                           ▼
//!        re-read head ─▶ diff::apply ─▶ commit_from(expected head)
//!                           │                 │ HeadMoved / Busy → re-read, retry
//!                           ▼                 ▼
//!        transition(Approved) ─▶ supersede_siblings ─▶ events
//! ```
//!
//! Approvals on one block are serialized by a review lock, so a sibling can
//! never be committed and then superseded. Every approval commit records its
//! proposal id on the version; a pending proposal whose id is already on a
//! version was interrupted after the commit, and approving it again (or
//! [`ApprovalWorkflow::reconcile`]) only finishes the bookkeeping.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use kioku_types::{
    BlockKey, Confidence, EditOperation, Proposal, ProposalId, ProposalStatus, ProposalSummary,
    Version, VersionId, agent_author,
};

use crate::config::StoreConfig;
use crate::diff::{self, DiffLine, DiffStats};
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent};
use crate::lock::BlockLocks;
use crate::proposal_store::{ProposalStore, Transition};
use crate::version_store::{NewVersion, VersionedStore};

/// Prefix of the commit message recorded for an approved proposal.
pub const APPROVAL_MESSAGE_PREFIX: &str = "Apply agent suggestion: ";

/// Characters of reasoning kept in the commit message.
pub const APPROVAL_MESSAGE_REASONING_CHARS: usize = 50;

/// Reviewer recorded when [`ApprovalWorkflow::reconcile`] finishes an approval.
pub const RECONCILE_REVIEWER: &str = "kioku:reconcile";

/// Commit message for an approved proposal.
pub fn approval_message(reasoning: &str) -> String {
    let head: String = reasoning.chars().take(APPROVAL_MESSAGE_REASONING_CHARS).collect();
    format!("{APPROVAL_MESSAGE_PREFIX}{head}")
}

/// What an agent submits.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub agent_id: String,
    /// Version the agent read; defaults to the current head.
    pub base_version: Option<VersionId>,
    pub field: Option<String>,
    pub operation: EditOperation,
    pub content: String,
    pub reasoning: String,
    pub confidence: Confidence,
}

/// Result of a successful approval.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub proposal: Proposal,
    pub version: Version,
    pub superseded: Vec<ProposalId>,
}

/// What approving a proposal would change, for review.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalDiff {
    pub proposal: ProposalSummary,
    /// Version the diff was rendered against (`None` for a missing block or a
    /// stale render against `base_value`).
    pub against: Option<VersionId>,
    /// The match text is gone from the head; rendered against `base_value`.
    pub stale: bool,
    pub lines: Vec<DiffLine>,
    pub stats: DiffStats,
}

pub struct ApprovalWorkflow {
    versions: Arc<dyn VersionedStore>,
    proposals: Arc<dyn ProposalStore>,
    review_locks: BlockLocks,
    events: EventBus,
    config: StoreConfig,
}

impl ApprovalWorkflow {
    pub fn new(
        versions: Arc<dyn VersionedStore>,
        proposals: Arc<dyn ProposalStore>,
        events: EventBus,
        config: StoreConfig,
    ) -> Self {
        // A review may wait on every commit attempt it makes.
        let review_timeout = config.lock_timeout * (config.attempts() + 1);
        Self {
            versions,
            proposals,
            review_locks: BlockLocks::new(review_timeout),
            events,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Propose
    // ========================================================================

    /// Queue an agent's suggestion. The block is not touched; it need not
    /// exist yet.
    #[tracing::instrument(skip(self, new), fields(block = %key, agent = %new.agent_id), name = "workflow.propose")]
    pub fn propose(&self, key: &BlockKey, new: NewProposal) -> Result<Proposal> {
        let (base_value, base_version) = match new.base_version {
            Some(seen) => (self.versions.at(key, seen)?.body, Some(seen)),
            None => match self.versions.current(key) {
                Ok((_, head)) => (head.body, Some(head.id)),
                Err(StoreError::NotFound { .. }) => (String::new(), None),
                Err(e) => return Err(e),
            },
        };

        let proposal = Proposal::new(
            key,
            new.agent_id,
            new.field,
            new.operation,
            base_value,
            base_version,
            new.content,
            new.reasoning,
            new.confidence,
        );
        self.proposals.save(&proposal)?;

        tracing::info!(
            proposal = %proposal.id,
            strategy = %proposal.operation.strategy(),
            confidence = proposal.confidence.as_str(),
            "queued proposal"
        );
        self.events.emit(StoreEvent::ProposalCreated {
            key: key.clone(),
            id: proposal.id,
        });
        Ok(proposal)
    }

    // ========================================================================
    // Approve
    // ========================================================================

    /// Apply a pending proposal to the block's current head.
    #[tracing::instrument(skip(self), name = "workflow.approve")]
    pub fn approve(&self, id: ProposalId, reviewer: &str) -> Result<Approval> {
        let key = self.proposals.get(id)?.key();
        self.review_locks.with_lock(&key, || {
            // Re-read under the lock: a sibling approval may have just landed.
            let proposal = self.proposals.get(id)?;
            if !proposal.is_pending() {
                return Err(StoreError::NotPending {
                    id,
                    status: proposal.status,
                });
            }

            let version = match self.versions.find_by_proposal(&key, id)? {
                Some(version) => {
                    tracing::warn!(proposal = %id, version = %version.id, "resuming approval committed earlier");
                    version
                }
                None => {
                    let version = self.commit_with_retry(&proposal, &key)?;
                    self.events.emit(StoreEvent::VersionCommitted {
                        key: key.clone(),
                        version: version.id,
                        seq: version.seq,
                        author: version.author.clone(),
                    });
                    version
                }
            };
            self.finish_approval(&key, id, version, reviewer)
        })
    }

    fn commit_with_retry(&self, proposal: &Proposal, key: &BlockKey) -> Result<Version> {
        let attempts = self.config.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit(proposal, key) {
                Err(e) if e.is_retryable() => {
                    if attempt >= attempts {
                        tracing::warn!(block = %key, attempts, error = %e, "approval still contended, giving up");
                        return Err(StoreError::Busy(key.clone()));
                    }
                    tracing::warn!(block = %key, attempt, error = %e, "approval contended, retrying");
                    std::thread::sleep(self.config.backoff(attempt));
                }
                other => return other,
            }
        }
    }

    /// One read-apply-commit pass against the true head.
    fn try_commit(&self, proposal: &Proposal, key: &BlockKey) -> Result<Version> {
        let head = match self.versions.current(key) {
            Ok((_, head)) => Some(head),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let base = head.as_ref().map_or("", |h| h.body.as_str());
        let body = diff::apply(base, &proposal.operation, &proposal.proposed_value)
            .map_err(|e| StoreError::from_apply(e, key))?;

        let message = approval_message(&proposal.reasoning);
        let author = agent_author(&proposal.agent_id);
        let new = NewVersion::new(&body, &message, &author).from_proposal(proposal.id);
        match head {
            Some(head) => self.versions.commit_from(key, new.on_head(head.id)),
            None => self.create_with(key, new),
        }
    }

    /// Create a block whose root is the approved body.
    fn create_with(&self, key: &BlockKey, root: NewVersion<'_>) -> Result<Version> {
        match self.versions.create_from(key, root) {
            Ok((block, version)) => {
                self.events.emit(StoreEvent::BlockCreated {
                    key: key.clone(),
                    version: block.current_version,
                });
                Ok(version)
            }
            // Lost the race to create it; retry against the winner's head.
            Err(StoreError::AlreadyExists(_)) => Err(StoreError::Busy(key.clone())),
            Err(e) => Err(e),
        }
    }

    /// Steps after the commit: mark approved, supersede siblings.
    fn finish_approval(
        &self,
        key: &BlockKey,
        id: ProposalId,
        version: Version,
        reviewer: &str,
    ) -> Result<Approval> {
        let proposal = self
            .bookkeeping("mark approved", key, || {
                self.proposals.transition(id, Transition::approved(version.id, reviewer))
            })
            .inspect_err(|e| {
                tracing::error!(
                    proposal = %id,
                    version = %version.id,
                    error = %e,
                    "version committed but proposal not marked approved; reconcile will finish it"
                );
            })?;
        let superseded = self.bookkeeping("supersede siblings", key, || {
            self.proposals.supersede_siblings(key, id)
        })?;

        tracing::info!(
            proposal = %id,
            block = %key,
            version = %version.id,
            superseded = superseded.len(),
            "approved proposal"
        );
        self.events.emit(StoreEvent::ProposalResolved {
            key: key.clone(),
            id,
            status: ProposalStatus::Approved,
        });
        for sibling in &superseded {
            self.events.emit(StoreEvent::ProposalResolved {
                key: key.clone(),
                id: *sibling,
                status: ProposalStatus::Superseded,
            });
        }

        Ok(Approval {
            proposal,
            version,
            superseded,
        })
    }

    /// Retry a post-commit write. Domain errors are final.
    fn bookkeeping<T>(&self, what: &str, key: &BlockKey, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.config.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(out) => return Ok(out),
                Err(e @ (StoreError::InvalidTransition { .. } | StoreError::NotFound { .. })) => {
                    return Err(e);
                }
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(block = %key, attempt, error = %e, "{} failed, retrying", what);
                    std::thread::sleep(self.config.backoff(attempt));
                }
            }
        }
    }

    // ========================================================================
    // Reject / expire / purge
    // ========================================================================

    /// Reject a pending proposal. No store mutation, siblings untouched.
    #[tracing::instrument(skip(self, reason), name = "workflow.reject")]
    pub fn reject(&self, id: ProposalId, reviewer: &str, reason: Option<String>) -> Result<Proposal> {
        let key = self.proposals.get(id)?.key();
        let proposal = self.review_locks.with_lock(&key, || {
            let current = self.proposals.get(id)?;
            if !current.is_pending() {
                return Err(StoreError::NotPending {
                    id,
                    status: current.status,
                });
            }
            // Already applied by an interrupted approval; finish that instead.
            if let Some(version) = self.versions.find_by_proposal(&key, id)? {
                tracing::warn!(proposal = %id, version = %version.id, "reject of an applied proposal, finishing approval");
                self.finish_approval(&key, id, version, RECONCILE_REVIEWER)?;
                return Err(StoreError::NotPending {
                    id,
                    status: ProposalStatus::Approved,
                });
            }
            self.proposals.transition(id, Transition::rejected(reviewer, reason))
        })?;

        tracing::info!(proposal = %id, block = %key, "rejected proposal");
        self.events.emit(StoreEvent::ProposalResolved {
            key,
            id,
            status: ProposalStatus::Rejected,
        });
        Ok(proposal)
    }

    /// Expire pending proposals created before `cutoff` (Unix millis).
    ///
    /// A proposal whose approval was interrupted after its commit is
    /// finished instead of expired.
    #[tracing::instrument(skip(self), name = "workflow.expire")]
    pub fn expire_pending(&self, cutoff: u64) -> Result<Vec<ProposalId>> {
        let mut expired = Vec::new();
        for proposal in self.proposals.pending_created_before(cutoff)? {
            let key = proposal.key();
            let result = self.review_locks.with_lock(&key, || {
                let current = self.proposals.get(proposal.id)?;
                if !current.is_pending() {
                    return Err(StoreError::NotPending {
                        id: proposal.id,
                        status: current.status,
                    });
                }
                if let Some(version) = self.versions.find_by_proposal(&key, proposal.id)? {
                    self.finish_approval(&key, proposal.id, version, RECONCILE_REVIEWER)?;
                    return Ok(false);
                }
                self.proposals.transition(proposal.id, Transition::expired())?;
                Ok(true)
            });
            match result {
                Ok(false) => {
                    tracing::warn!(proposal = %proposal.id, "finished interrupted approval instead of expiring");
                }
                Ok(true) => {
                    self.events.emit(StoreEvent::ProposalResolved {
                        key,
                        id: proposal.id,
                        status: ProposalStatus::Expired,
                    });
                    expired.push(proposal.id);
                }
                // Reviewed or locked meanwhile; leave it.
                Err(
                    e @ (StoreError::NotPending { .. }
                    | StoreError::InvalidTransition { .. }
                    | StoreError::Busy(_)),
                ) => {
                    tracing::debug!(proposal = %proposal.id, error = %e, "skipped expiry");
                }
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale proposals");
        }
        Ok(expired)
    }

    /// Delete terminal proposals reviewed before `cutoff` (Unix millis).
    pub fn purge_terminal(&self, cutoff: u64) -> Result<usize> {
        let purged = self.proposals.purge_terminal(cutoff)?;
        tracing::info!(purged, "purged reviewed proposals");
        Ok(purged)
    }

    /// Finish approvals whose commit landed but whose status write did not.
    #[tracing::instrument(skip(self), name = "workflow.reconcile")]
    pub fn reconcile(&self, owner_id: &str) -> Result<Vec<ProposalId>> {
        let mut finished = Vec::new();
        for proposal in self.proposals.list_pending(owner_id, None)? {
            let key = proposal.key();
            let Some(version) = self.versions.find_by_proposal(&key, proposal.id)? else {
                continue;
            };
            let result = self.review_locks.with_lock(&key, || {
                if !self.proposals.get(proposal.id)?.is_pending() {
                    return Ok(false);
                }
                self.finish_approval(&key, proposal.id, version, RECONCILE_REVIEWER)?;
                Ok(true)
            });
            match result {
                Ok(true) => finished.push(proposal.id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(proposal = %proposal.id, block = %key, error = %e, "reconcile failed");
                }
            }
        }
        if !finished.is_empty() {
            tracing::warn!(owner = owner_id, count = finished.len(), "reconciled interrupted approvals");
        }
        Ok(finished)
    }

    /// [`reconcile`](Self::reconcile) every owner with pending proposals.
    pub fn reconcile_all(&self) -> Result<Vec<ProposalId>> {
        let owners: BTreeSet<String> = self
            .proposals
            .pending_created_before(u64::MAX)?
            .into_iter()
            .map(|p| p.owner_id)
            .collect();
        let mut finished = Vec::new();
        for owner in owners {
            finished.extend(self.reconcile(&owner)?);
        }
        Ok(finished)
    }

    // ========================================================================
    // Review diff
    // ========================================================================

    /// Render what approving `id` would do (or did, once approved).
    pub fn diff(&self, id: ProposalId) -> Result<ProposalDiff> {
        let proposal = self.proposals.get(id)?;
        let key = proposal.key();

        if let (ProposalStatus::Approved, Some(applied)) = (proposal.status, proposal.applied_version) {
            let version = self.versions.at(&key, applied)?;
            let parent_body = match version.parent_version {
                Some(parent) => self.versions.at(&key, parent)?.body,
                None => String::new(),
            };
            return Ok(build_diff(&proposal, version.parent_version, false, &parent_body, &version.body));
        }

        let head = match self.versions.current(&key) {
            Ok((_, head)) => Some(head),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let base = head.as_ref().map_or("", |h| h.body.as_str());
        match diff::apply(base, &proposal.operation, &proposal.proposed_value) {
            Ok(after) => Ok(build_diff(&proposal, head.as_ref().map(|h| h.id), false, base, &after)),
            Err(diff::ApplyError::MatchNotFound) => {
                // Show what the agent saw.
                let old = proposal.base_value.as_str();
                let after = diff::apply(old, &proposal.operation, &proposal.proposed_value)
                    .unwrap_or_else(|_| proposal.proposed_value.clone());
                Ok(build_diff(&proposal, None, true, old, &after))
            }
        }
    }
}

fn build_diff(
    proposal: &Proposal,
    against: Option<VersionId>,
    stale: bool,
    old: &str,
    new: &str,
) -> ProposalDiff {
    let lines = diff::render_diff(old, new);
    let stats = diff::diff_stats(&lines);
    ProposalDiff {
        proposal: proposal.summary(),
        against,
        stale,
        lines,
        stats,
    }
}
